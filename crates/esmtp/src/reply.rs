use serde::{Deserialize, Serialize};

/// RFC 2034 three-part status code. Emitted between the reply code and
/// the text, and only when the session negotiated ENHANCEDSTATUSCODES.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EnhancedStatusCode {
    pub class: u8,
    pub subject: u16,
    pub detail: u16,
}

impl std::fmt::Display for EnhancedStatusCode {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(fmt, "{}.{}.{}", self.class, self.subject, self.detail)
    }
}

/// A client-scheduled reply: the code it asked for, and optionally the
/// enhanced triple it asked for. The text is always the canonical
/// message for the code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyntheticReply {
    pub code: u16,
    pub enhanced: Option<EnhancedStatusCode>,
}

impl SyntheticReply {
    pub fn new(code: u16) -> Self {
        Self {
            code,
            enhanced: None,
        }
    }

    /// Render the full reply line (without CRLF).
    pub fn render(&self, enhanced_enabled: bool) -> String {
        match self.enhanced {
            Some(enhanced) if enhanced_enabled => {
                format!("{} {} {}", self.code, enhanced, canonical_message(self.code))
            }
            _ => format!("{} {}", self.code, canonical_message(self.code)),
        }
    }
}

/// The standard text for a reply code. Codes outside the table resolve
/// to "Unknown error" rather than failing; clients are free to schedule
/// any three-digit code.
pub fn canonical_message(code: u16) -> &'static str {
    match code {
        421 => "Service not available, closing transmission channel",
        450 => "Requested mail action not taken: mailbox unavailable",
        451 => "Requested action aborted: local error in processing",
        452 => "Requested action not taken: insufficient system storage",
        500 => "Syntax error, command unrecognized",
        501 => "Syntax error in parameters or arguments",
        502 => "Command not implemented",
        503 => "Bad sequence of commands",
        504 => "Command parameter not implemented",
        521 => "Machine does not accept mail",
        535 => "Authentication failed",
        550 => "Requested action not taken: mailbox unavailable",
        551 => "User not local; please try forward path",
        552 => "Requested mail action aborted: exceeded storage allocation",
        553 => "Requested action not taken: mailbox name not allowed",
        554 => "Transaction failed",
        571 => "Blocked - see https://faultmta.test/blocked",
        _ => "Unknown error",
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use k9::assert_equal;

    #[test]
    fn canonical_messages() {
        assert_equal!(
            canonical_message(550),
            "Requested action not taken: mailbox unavailable"
        );
        assert_equal!(
            canonical_message(552),
            "Requested mail action aborted: exceeded storage allocation"
        );
        assert_equal!(canonical_message(299), "Unknown error");
        assert_equal!(canonical_message(599), "Unknown error");
    }

    #[test]
    fn render_with_and_without_enhanced() {
        let plain = SyntheticReply::new(550);
        assert_equal!(
            plain.render(true),
            "550 Requested action not taken: mailbox unavailable"
        );

        let enhanced = SyntheticReply {
            code: 550,
            enhanced: Some(EnhancedStatusCode {
                class: 5,
                subject: 1,
                detail: 1,
            }),
        };
        assert_equal!(
            enhanced.render(true),
            "550 5.1.1 Requested action not taken: mailbox unavailable"
        );
        // Not negotiated: the triple is withheld even when present.
        assert_equal!(
            enhanced.render(false),
            "550 Requested action not taken: mailbox unavailable"
        );
    }

    #[test]
    fn multi_digit_components_render_verbatim() {
        let reply = SyntheticReply {
            code: 554,
            enhanced: Some(EnhancedStatusCode {
                class: 5,
                subject: 7,
                detail: 509,
            }),
        };
        assert_equal!(reply.render(true), "554 5.7.509 Transaction failed");
    }
}
