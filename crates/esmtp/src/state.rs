use serde::Serialize;

/// Where a session sits in the SMTP conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SessionState {
    /// Connected, banner not yet acknowledged by a HELO/EHLO.
    Greeting,
    /// Banner sent, waiting for HELO/EHLO.
    Helo,
    /// Mid-authentication dialogue.
    Auth,
    /// Ready for MAIL FROM.
    Mail,
    /// Transaction open, collecting recipients.
    Rcpt,
    /// Reading message content after DATA.
    Data,
    /// Accumulating BDAT chunks.
    Bdat,
    /// Terminal.
    Quit,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        let name = match self {
            Self::Greeting => "GREETING",
            Self::Helo => "HELO",
            Self::Auth => "AUTH",
            Self::Mail => "MAIL",
            Self::Rcpt => "RCPT",
            Self::Data => "DATA",
            Self::Bdat => "BDAT",
            Self::Quit => "QUIT",
        };
        fmt.write_str(name)
    }
}

impl SessionState {
    /// RFC 5321 command sequencing, as this server enforces it.
    /// A command that fails this check gets `503 Bad sequence of
    /// commands` and must not mutate the session.
    pub fn allows_command(&self, verb: &str) -> bool {
        use SessionState::*;
        match verb {
            "HELO" | "EHLO" => matches!(self, Helo | Mail),
            "AUTH" => matches!(self, Mail | Auth),
            "MAIL" => matches!(self, Mail),
            "RCPT" => matches!(self, Rcpt),
            "DATA" => matches!(self, Rcpt),
            "BDAT" => matches!(self, Rcpt | Bdat),
            "STARTTLS" => matches!(self, Helo | Mail),
            // Legal anywhere once the banner is out; RSET from BDAT
            // recovers an aborted chunked transaction.
            "RSET" | "NOOP" | "QUIT" => !matches!(self, Greeting),
            // VRFY never mutates state.
            "VRFY" => !matches!(self, Greeting),
            _ => false,
        }
    }

    /// The permitted edges of the session state machine.
    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        match self {
            Greeting => matches!(next, Helo),
            Helo => matches!(next, Mail | Auth),
            Auth => matches!(next, Mail),
            Mail => matches!(next, Rcpt | Quit),
            Rcpt => matches!(next, Rcpt | Data | Bdat | Quit),
            Data => matches!(next, Mail | Quit),
            Bdat => matches!(next, Bdat | Mail | Quit),
            Quit => false,
        }
    }
}

#[cfg(test)]
mod test {
    use super::SessionState::*;

    #[test]
    fn command_sequencing() {
        assert!(Helo.allows_command("EHLO"));
        assert!(Mail.allows_command("EHLO"));
        assert!(!Rcpt.allows_command("EHLO"));

        assert!(Mail.allows_command("MAIL"));
        assert!(!Rcpt.allows_command("MAIL"));
        assert!(!Helo.allows_command("MAIL"));

        assert!(Rcpt.allows_command("RCPT"));
        assert!(Rcpt.allows_command("DATA"));
        assert!(Rcpt.allows_command("BDAT"));
        assert!(Bdat.allows_command("BDAT"));
        assert!(!Mail.allows_command("DATA"));

        assert!(Helo.allows_command("STARTTLS"));
        assert!(Mail.allows_command("STARTTLS"));
        assert!(!Rcpt.allows_command("STARTTLS"));

        for state in [Helo, Auth, Mail, Rcpt, Data, Bdat, Quit] {
            assert!(state.allows_command("VRFY"), "VRFY allowed in {state}");
            assert!(!state.allows_command("EXPN"), "EXPN unknown in {state}");
        }

        assert!(!Greeting.allows_command("NOOP"));
        assert!(!Greeting.allows_command("VRFY"));
        assert!(Data.allows_command("QUIT"));
        assert!(Bdat.allows_command("RSET"));
        assert!(Data.allows_command("RSET"));
    }

    #[test]
    fn transition_edges() {
        assert!(Greeting.can_transition_to(Helo));
        assert!(!Greeting.can_transition_to(Mail));
        assert!(Helo.can_transition_to(Mail));
        assert!(Helo.can_transition_to(Auth));
        assert!(Auth.can_transition_to(Mail));
        assert!(Mail.can_transition_to(Rcpt));
        assert!(Rcpt.can_transition_to(Rcpt));
        assert!(Rcpt.can_transition_to(Data));
        assert!(Rcpt.can_transition_to(Bdat));
        assert!(Data.can_transition_to(Mail));
        assert!(Bdat.can_transition_to(Bdat));
        assert!(Bdat.can_transition_to(Mail));
        assert!(!Quit.can_transition_to(Helo));
        assert!(!Data.can_transition_to(Rcpt));
    }
}
