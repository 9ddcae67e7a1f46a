use prost::bytes::{Buf, BufMut};
use prost::encoding::{self, DecodeContext, WireType};
use prost::DecodeError;

/// The numeric message kinds carried in the envelope's `type` field. The
/// numeric value doubles as the protobuf field number under which the
/// kind's extension payload is nested, matching the wire layout described
/// in §4.9.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    SendCommand,
    SetState,
    SendHIDEvent,
    ClientUpdatesConfig,
    DeviceInfo,
    TextInput,
    PlaybackQueueRequest,
    CryptoPairing,
    WakeDevice,
    SetConnectionState,
    GenericMessage,
    SendButtonEvent,
    Unknown(i32),
}

impl MessageType {
    #[must_use]
    pub fn field_number(self) -> i32 {
        match self {
            MessageType::SendCommand => 1,
            MessageType::SetState => 4,
            MessageType::SendHIDEvent => 8,
            MessageType::DeviceInfo => 15,
            MessageType::ClientUpdatesConfig => 16,
            MessageType::TextInput => 25,
            MessageType::PlaybackQueueRequest => 32,
            MessageType::CryptoPairing => 34,
            MessageType::SetConnectionState => 38,
            MessageType::WakeDevice => 41,
            MessageType::GenericMessage => 42,
            MessageType::SendButtonEvent => 43,
            MessageType::Unknown(n) => n,
        }
    }

    #[must_use]
    pub fn from_field_number(n: i32) -> Self {
        match n {
            1 => MessageType::SendCommand,
            4 => MessageType::SetState,
            8 => MessageType::SendHIDEvent,
            15 => MessageType::DeviceInfo,
            16 => MessageType::ClientUpdatesConfig,
            25 => MessageType::TextInput,
            32 => MessageType::PlaybackQueueRequest,
            34 => MessageType::CryptoPairing,
            38 => MessageType::SetConnectionState,
            41 => MessageType::WakeDevice,
            42 => MessageType::GenericMessage,
            43 => MessageType::SendButtonEvent,
            other => MessageType::Unknown(other),
        }
    }
}

impl Default for MessageType {
    fn default() -> Self {
        MessageType::Unknown(0)
    }
}

/// The MRP wire envelope: a numeric type tag, an optional random request
/// identifier, and a nested extension message carried raw (already encoded
/// by the caller under its own schema).
///
/// Every kind except `CryptoPairing` carries an identifier; callers are
/// responsible for omitting it for that one kind, per §4.9.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Envelope {
    pub message_type: MessageType,
    pub identifier: Option<String>,
    pub extension: Vec<u8>,
}

impl Envelope {
    #[must_use]
    pub fn new(message_type: MessageType, identifier: Option<String>, extension: Vec<u8>) -> Self {
        Self {
            message_type,
            identifier,
            extension,
        }
    }
}

impl prost::Message for Envelope {
    fn encode_raw(&self, buf: &mut impl BufMut) {
        encoding::int32::encode(1, &self.message_type.field_number(), buf);
        if let Some(identifier) = &self.identifier {
            encoding::string::encode(2, identifier, buf);
        }
        if !self.extension.is_empty() {
            encoding::bytes::encode(self.message_type.field_number() as u32, &self.extension, buf);
        }
    }

    fn merge_field(
        &mut self,
        tag: u32,
        wire_type: WireType,
        buf: &mut impl Buf,
        ctx: DecodeContext,
    ) -> Result<(), DecodeError> {
        match tag {
            1 => {
                let mut value = 0i32;
                encoding::int32::merge(wire_type, &mut value, buf, ctx)?;
                self.message_type = MessageType::from_field_number(value);
                Ok(())
            }
            2 => {
                let mut value = String::new();
                encoding::string::merge(wire_type, &mut value, buf, ctx)?;
                self.identifier = Some(value);
                Ok(())
            }
            n => {
                let mut value = Vec::new();
                encoding::bytes::merge(wire_type, &mut value, buf, ctx)?;
                self.extension = value;
                self.message_type = MessageType::from_field_number(n as i32);
                Ok(())
            }
        }
    }

    fn encoded_len(&self) -> usize {
        let mut len = encoding::int32::encoded_len(1, &self.message_type.field_number());
        if let Some(identifier) = &self.identifier {
            len += encoding::string::encoded_len(2, identifier);
        }
        if !self.extension.is_empty() {
            len += encoding::bytes::encoded_len(self.message_type.field_number() as u32, &self.extension);
        }
        len
    }

    fn clear(&mut self) {
        *self = Envelope::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn round_trips_an_envelope_with_identifier_and_extension() {
        let envelope = Envelope::new(
            MessageType::DeviceInfo,
            Some("req-1".to_string()),
            vec![0xAA, 0xBB, 0xCC],
        );
        let mut buf = Vec::new();
        envelope.encode(&mut buf).unwrap();

        let decoded = Envelope::decode(buf.as_slice()).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn crypto_pairing_omits_identifier() {
        let envelope = Envelope::new(MessageType::CryptoPairing, None, vec![1, 2, 3]);
        let mut buf = Vec::new();
        envelope.encode(&mut buf).unwrap();

        let decoded = Envelope::decode(buf.as_slice()).unwrap();
        assert!(decoded.identifier.is_none());
        assert_eq!(decoded.message_type, MessageType::CryptoPairing);
    }

    #[test]
    fn field_numbers_match_the_required_outbound_kinds() {
        assert_eq!(MessageType::DeviceInfo.field_number(), 15);
        assert_eq!(MessageType::SendCommand.field_number(), 1);
        assert_eq!(MessageType::SendHIDEvent.field_number(), 8);
        assert_eq!(MessageType::SendButtonEvent.field_number(), 43);
        assert_eq!(MessageType::SetConnectionState.field_number(), 38);
        assert_eq!(MessageType::ClientUpdatesConfig.field_number(), 16);
        assert_eq!(MessageType::CryptoPairing.field_number(), 34);
        assert_eq!(MessageType::WakeDevice.field_number(), 41);
        assert_eq!(MessageType::TextInput.field_number(), 25);
        assert_eq!(MessageType::PlaybackQueueRequest.field_number(), 32);
        assert_eq!(MessageType::GenericMessage.field_number(), 42);
        assert_eq!(MessageType::SetState.field_number(), 4);
    }
}
