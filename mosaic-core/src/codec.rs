//! Postcard codec for the wire record, one datagram per message.

use std::fmt;

use crate::message::WireMessage;

/// Failure to decode an inbound datagram.
///
/// The protocol treats this like message loss: receivers log it and drop
/// the datagram.
#[derive(Debug)]
pub struct DecodeError(postcard::Error);

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "malformed wire message: {}", self.0)
    }
}

impl std::error::Error for DecodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.0)
    }
}

/// Encode a message into datagram bytes.
#[must_use]
pub fn encode(msg: &WireMessage) -> Vec<u8> {
    postcard::to_allocvec(msg).expect("wire message serialization should not fail")
}

/// Decode datagram bytes back into a message.
///
/// # Errors
///
/// Returns [`DecodeError`] if the bytes are not a well-formed record.
pub fn decode(bytes: &[u8]) -> Result<WireMessage, DecodeError> {
    postcard::from_bytes(bytes).map_err(DecodeError)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageKind;

    #[test]
    fn roundtrip_prepare() {
        let msg = WireMessage::prepare(
            "out.jpg".to_owned(),
            vec![0, 1, 2, 255, 254],
            vec!["a1.jpg".to_owned(), "a2.jpg".to_owned()],
        );
        let decoded = decode(&encode(&msg)).unwrap();
        assert_eq!(decoded, msg);
        // content is bit-identical and source order is preserved
        assert_eq!(decoded.content, vec![0, 1, 2, 255, 254]);
        assert_eq!(decoded.sources, ["a1.jpg", "a2.jpg"]);
    }

    #[test]
    fn roundtrip_all_kinds() {
        for kind in [
            MessageKind::Prepare,
            MessageKind::VoteCommit,
            MessageKind::VoteAbort,
            MessageKind::CommitSuc,
            MessageKind::CommitFail,
            MessageKind::Ack,
        ] {
            let msg = WireMessage {
                kind,
                file_name: "f".to_owned(),
                content: Vec::new(),
                sources: Vec::new(),
            };
            assert_eq!(decode(&encode(&msg)).unwrap().kind, kind);
        }
    }

    #[test]
    fn empty_content_roundtrip() {
        let msg = WireMessage::decision(MessageKind::CommitSuc, "f".to_owned(), vec![]);
        let decoded = decode(&encode(&msg)).unwrap();
        assert!(decoded.content.is_empty());
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(decode(&[0xFF, 0xFF, 0xFF, 0xFF, 0xFF]).is_err());
    }

    #[test]
    fn reply_echoes_fingerprint_and_sources() {
        let prepare = WireMessage::prepare(
            "out.jpg".to_owned(),
            vec![1, 2, 3],
            vec!["a1".to_owned()],
        );
        let vote = prepare.reply(MessageKind::VoteCommit);
        assert_eq!(vote.file_name, "out.jpg");
        assert_eq!(vote.sources, ["a1"]);
        assert!(vote.content.is_empty());
    }
}
