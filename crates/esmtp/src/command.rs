/// A parsed SMTP command line.
///
/// Verbs are matched case-insensitively and the argument shape is
/// validated during parsing, so a successfully parsed command is
/// structurally sound even if its arguments are semantically bogus.
/// Verbs we don't know about parse into [`Command::Unknown`] so that a
/// registered extension gets a chance to claim them before the server
/// answers 500.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Helo {
        domain: String,
    },
    Ehlo {
        domain: String,
    },
    Auth {
        mechanism: String,
        initial_response: Option<String>,
    },
    /// The raw argument text following `MAIL `, with the leading
    /// `FROM:` already verified to be present.
    MailFrom {
        arg: String,
    },
    /// The raw argument text following `RCPT `, with the leading
    /// `TO:` already verified to be present.
    RcptTo {
        arg: String,
    },
    Data,
    Bdat {
        size: u64,
        last: bool,
    },
    Rset,
    Noop,
    Quit,
    StartTls,
    Vrfy {
        target: String,
    },
    Unknown {
        verb: String,
        args: Vec<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    /// Blank line; the session skips these without replying.
    Empty,
    /// Known verb, malformed arguments. Maps to `501`.
    Syntax,
}

impl Command {
    pub fn parse(line: &str) -> Result<Self, ParseError> {
        let line = line.trim();
        if line.is_empty() {
            return Err(ParseError::Empty);
        }

        let mut fields = line.split_whitespace();
        let verb = fields.next().expect("non-empty line has a first field");
        let rest = line[verb.len()..].trim();

        if verb.eq_ignore_ascii_case("HELO") || verb.eq_ignore_ascii_case("EHLO") {
            let mut args = rest.split_whitespace();
            let domain = args.next().ok_or(ParseError::Syntax)?.to_string();
            return Ok(if verb.eq_ignore_ascii_case("EHLO") {
                Self::Ehlo { domain }
            } else {
                Self::Helo { domain }
            });
        }

        if verb.eq_ignore_ascii_case("MAIL") {
            if !rest.get(..5).map_or(false, |p| p.eq_ignore_ascii_case("FROM:")) {
                return Err(ParseError::Syntax);
            }
            return Ok(Self::MailFrom {
                arg: rest.to_string(),
            });
        }

        if verb.eq_ignore_ascii_case("RCPT") {
            if !rest.get(..3).map_or(false, |p| p.eq_ignore_ascii_case("TO:")) {
                return Err(ParseError::Syntax);
            }
            return Ok(Self::RcptTo {
                arg: rest.to_string(),
            });
        }

        if verb.eq_ignore_ascii_case("AUTH") {
            let mut args = rest.split_whitespace();
            let mechanism = args.next().ok_or(ParseError::Syntax)?.to_string();
            let initial_response = args.next().map(|s| s.to_string());
            return Ok(Self::Auth {
                mechanism,
                initial_response,
            });
        }

        if verb.eq_ignore_ascii_case("BDAT") {
            let mut args = rest.split_whitespace();
            let size: u64 = args
                .next()
                .and_then(|s| s.parse().ok())
                .ok_or(ParseError::Syntax)?;
            let last = match args.next() {
                None => false,
                Some(word) if word.eq_ignore_ascii_case("LAST") => true,
                Some(_) => return Err(ParseError::Syntax),
            };
            return Ok(Self::Bdat { size, last });
        }

        if verb.eq_ignore_ascii_case("VRFY") {
            if rest.is_empty() {
                return Err(ParseError::Syntax);
            }
            return Ok(Self::Vrfy {
                target: rest.to_string(),
            });
        }

        if verb.eq_ignore_ascii_case("DATA") {
            return Ok(Self::Data);
        }
        if verb.eq_ignore_ascii_case("RSET") {
            return Ok(Self::Rset);
        }
        if verb.eq_ignore_ascii_case("NOOP") {
            return Ok(Self::Noop);
        }
        if verb.eq_ignore_ascii_case("QUIT") {
            return Ok(Self::Quit);
        }
        if verb.eq_ignore_ascii_case("STARTTLS") {
            return Ok(Self::StartTls);
        }

        Ok(Self::Unknown {
            verb: verb.to_ascii_uppercase(),
            args: fields.map(|s| s.to_string()).collect(),
        })
    }

    /// Canonical verb token, used for logging, state checks and the
    /// pipelining-breaking test.
    pub fn verb(&self) -> &str {
        match self {
            Self::Helo { .. } => "HELO",
            Self::Ehlo { .. } => "EHLO",
            Self::Auth { .. } => "AUTH",
            Self::MailFrom { .. } => "MAIL",
            Self::RcptTo { .. } => "RCPT",
            Self::Data => "DATA",
            Self::Bdat { .. } => "BDAT",
            Self::Rset => "RSET",
            Self::Noop => "NOOP",
            Self::Quit => "QUIT",
            Self::StartTls => "STARTTLS",
            Self::Vrfy { .. } => "VRFY",
            Self::Unknown { verb, .. } => verb,
        }
    }

    /// Commands that force the pipelining queue to flush before they
    /// execute: they either consume the stream themselves, run a
    /// multi-step dialogue, or end the session.
    pub fn breaks_pipelining(&self) -> bool {
        matches!(
            self,
            Self::Data | Self::Bdat { .. } | Self::Auth { .. } | Self::StartTls | Self::Quit
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use k9::assert_equal;

    #[test]
    fn verbs_parse_case_insensitively() {
        assert_equal!(Command::parse("QUIT").unwrap(), Command::Quit);
        assert_equal!(Command::parse("quit").unwrap(), Command::Quit);
        assert_equal!(Command::parse("  rset  ").unwrap(), Command::Rset);
        assert_equal!(Command::parse("StArTtLs").unwrap(), Command::StartTls);
        assert_equal!(
            Command::parse("quite").unwrap(),
            Command::Unknown {
                verb: "QUITE".to_string(),
                args: vec![],
            }
        );
    }

    #[test]
    fn helo_requires_a_domain() {
        assert_equal!(
            Command::parse("EHLO client.example").unwrap(),
            Command::Ehlo {
                domain: "client.example".to_string()
            }
        );
        assert_equal!(Command::parse("HELO"), Err(ParseError::Syntax));
        assert_equal!(Command::parse("EHLO"), Err(ParseError::Syntax));
    }

    #[test]
    fn mail_and_rcpt_require_their_prefixes() {
        assert_equal!(
            Command::parse("MAIL FROM:<a@x>").unwrap(),
            Command::MailFrom {
                arg: "FROM:<a@x>".to_string()
            }
        );
        assert_equal!(
            Command::parse("mail from:<a@x>").unwrap(),
            Command::MailFrom {
                arg: "from:<a@x>".to_string()
            }
        );
        assert_equal!(Command::parse("MAIL <a@x>"), Err(ParseError::Syntax));
        assert_equal!(
            Command::parse("RCPT TO:<b@y>").unwrap(),
            Command::RcptTo {
                arg: "TO:<b@y>".to_string()
            }
        );
        assert_equal!(Command::parse("RCPT FROM:<b@y>"), Err(ParseError::Syntax));
        assert_equal!(Command::parse("RCPT"), Err(ParseError::Syntax));
    }

    #[test]
    fn bdat_parses_size_and_last() {
        assert_equal!(
            Command::parse("BDAT 100").unwrap(),
            Command::Bdat {
                size: 100,
                last: false
            }
        );
        assert_equal!(
            Command::parse("BDAT 0 LAST").unwrap(),
            Command::Bdat {
                size: 0,
                last: true
            }
        );
        assert_equal!(
            Command::parse("bdat 12 last").unwrap(),
            Command::Bdat {
                size: 12,
                last: true
            }
        );
        assert_equal!(Command::parse("BDAT"), Err(ParseError::Syntax));
        assert_equal!(Command::parse("BDAT -5"), Err(ParseError::Syntax));
        assert_equal!(Command::parse("BDAT ten"), Err(ParseError::Syntax));
        assert_equal!(Command::parse("BDAT 10 MIDDLE"), Err(ParseError::Syntax));
    }

    #[test]
    fn auth_takes_mechanism_and_optional_response() {
        assert_equal!(
            Command::parse("AUTH PLAIN dGVzdA==").unwrap(),
            Command::Auth {
                mechanism: "PLAIN".to_string(),
                initial_response: Some("dGVzdA==".to_string()),
            }
        );
        assert_equal!(
            Command::parse("AUTH LOGIN").unwrap(),
            Command::Auth {
                mechanism: "LOGIN".to_string(),
                initial_response: None,
            }
        );
        assert_equal!(Command::parse("AUTH"), Err(ParseError::Syntax));
    }

    #[test]
    fn vrfy_keeps_the_whole_argument() {
        assert_equal!(
            Command::parse("VRFY Jane Doe <exists@example.com>").unwrap(),
            Command::Vrfy {
                target: "Jane Doe <exists@example.com>".to_string()
            }
        );
        assert_equal!(Command::parse("VRFY"), Err(ParseError::Syntax));
    }

    #[test]
    fn blank_lines_are_empty() {
        assert_equal!(Command::parse(""), Err(ParseError::Empty));
        assert_equal!(Command::parse("   "), Err(ParseError::Empty));
    }
}
