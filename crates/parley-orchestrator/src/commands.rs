//! Inbound keyword classification.

use parley_types::MessagePayload;

const OPT_IN_KEYWORDS: &[&str] = &["1", "start", "yes", "begin"];
const MENU_OPT_OUT_KEYWORDS: &[&str] = &["2", "no", "decline"];
const STOP_KEYWORDS: &[&str] = &["stop", "exit", "quit", "cancel"];
const OPT_OUT_KEYWORDS: &[&str] = &["opt out", "opt-out", "unsubscribe", "decline"];

/// Enumerates supported `InboundIntent` values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundIntent {
    OptIn,
    OptOut,
    Stop,
    Response(String),
    Empty,
}

impl InboundIntent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OptIn => "opt_in",
            Self::OptOut => "opt_out",
            Self::Stop => "stop",
            Self::Response(_) => "response",
            Self::Empty => "empty",
        }
    }
}

/// Lowercases, trims and strips surrounding punctuation; inner spaces collapse to one.
pub fn normalize_command_text(text: &str) -> String {
    let trimmed = text
        .trim()
        .trim_matches(|ch: char| !ch.is_alphanumeric())
        .to_lowercase();
    trimmed.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Classifies a text message. Menu keywords only apply when no session is live,
/// so numeric answers during an interview are never read as commands.
pub fn classify_inbound(text: &str, has_session: bool) -> InboundIntent {
    let normalized = normalize_command_text(text);
    if normalized.is_empty() {
        return if text.trim().is_empty() {
            InboundIntent::Empty
        } else {
            InboundIntent::Response(text.trim().to_string())
        };
    }
    if STOP_KEYWORDS.contains(&normalized.as_str()) {
        return InboundIntent::Stop;
    }
    if OPT_OUT_KEYWORDS.contains(&normalized.as_str()) {
        return InboundIntent::OptOut;
    }
    if !has_session {
        if OPT_IN_KEYWORDS.contains(&normalized.as_str()) {
            return InboundIntent::OptIn;
        }
        if MENU_OPT_OUT_KEYWORDS.contains(&normalized.as_str()) {
            return InboundIntent::OptOut;
        }
    }
    InboundIntent::Response(text.trim().to_string())
}

/// Classifies a payload; audio with a live session is always a response.
pub fn classify_payload(payload: &MessagePayload, has_session: bool) -> InboundIntent {
    if payload.has_audio() && has_session {
        return InboundIntent::Response(payload.text_or_empty().trim().to_string());
    }
    classify_inbound(payload.text_or_empty(), has_session)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_menu_keywords_apply_only_without_session() {
        assert_eq!(classify_inbound("1", false), InboundIntent::OptIn);
        assert_eq!(classify_inbound(" Start! ", false), InboundIntent::OptIn);
        assert_eq!(classify_inbound("2", false), InboundIntent::OptOut);
        assert_eq!(
            classify_inbound("1", true),
            InboundIntent::Response("1".to_string())
        );
        assert_eq!(
            classify_inbound("yes", true),
            InboundIntent::Response("yes".to_string())
        );
    }

    #[test]
    fn unit_stop_and_opt_out_apply_in_any_state() {
        for has_session in [false, true] {
            assert_eq!(classify_inbound("STOP", has_session), InboundIntent::Stop);
            assert_eq!(classify_inbound("quit.", has_session), InboundIntent::Stop);
            assert_eq!(
                classify_inbound("Opt   out", has_session),
                InboundIntent::OptOut
            );
            assert_eq!(
                classify_inbound("unsubscribe", has_session),
                InboundIntent::OptOut
            );
        }
    }

    #[test]
    fn unit_empty_and_punctuation_only_text() {
        assert_eq!(classify_inbound("   ", false), InboundIntent::Empty);
        assert_eq!(
            classify_inbound("??", true),
            InboundIntent::Response("??".to_string())
        );
    }

    #[test]
    fn functional_audio_payload_with_session_is_response() {
        let payload = MessagePayload::audio("media://1");
        assert_eq!(
            classify_payload(&payload, true),
            InboundIntent::Response(String::new())
        );
        assert_eq!(classify_payload(&payload, false), InboundIntent::Empty);
    }

    #[test]
    fn regression_sentences_containing_keywords_are_not_commands() {
        assert_eq!(
            classify_inbound("I would like to stop by later", true),
            InboundIntent::Response("I would like to stop by later".to_string())
        );
    }
}
