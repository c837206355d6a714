use crate::frame::{Frame, MessageFrame};

/// An immutable message delivered by a broker. Owned by the dispatch loop
/// for the duration of one callback invocation; callbacks must not retain
/// it past their return if the caller relies on ack/requeue semantics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    id: [u8; 16],
    timestamp: i64,
    attempts: u16,
    body: Vec<u8>,
}

impl Message {
    pub fn from_frame(frame: &Frame) -> Option<Message> {
        match frame {
            Frame::Message(MessageFrame {
                timestamp,
                attempts,
                id,
                body,
            }) => Some(Message {
                id: *id,
                timestamp: *timestamp,
                attempts: *attempts,
                body: body.clone(),
            }),
            _ => None,
        }
    }

    /// The 16 raw id bytes exactly as the broker sent them. NSQ message ids
    /// are already printable ASCII, so this is also what FIN/REQ expect.
    pub fn id_bytes(&self) -> &[u8; 16] {
        &self.id
    }

    pub fn id(&self) -> String {
        String::from_utf8_lossy(&self.id).into_owned()
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn attempts(&self) -> u16 {
        self.attempts
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn built_from_a_message_frame() {
        let frame = Frame::Message(MessageFrame {
            timestamp: 123,
            attempts: 2,
            id: *b"0123456789abcdef",
            body: b"payload".to_vec(),
        });

        let msg = Message::from_frame(&frame).unwrap();
        assert_eq!("0123456789abcdef", msg.id());
        assert_eq!(123, msg.timestamp());
        assert_eq!(2, msg.attempts());
        assert_eq!(b"payload", msg.body());
    }

    #[test]
    fn not_built_from_other_frame_kinds() {
        let frame = Frame::Response(b"OK".to_vec());
        assert!(Message::from_frame(&frame).is_none());
    }
}
