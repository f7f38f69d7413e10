//! Control-channel command/response wire types and the opcode table.

/// A decoded control-channel request: an opcode plus its raw body bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub opcode: u8,
    pub body: Vec<u8>,
}

impl Command {
    /// Splits a [`crate::control_codec::Decoder`]-yielded frame body into its
    /// leading opcode octet and the remaining command body. `None` for an
    /// empty frame.
    pub fn from_frame(frame: &[u8]) -> Option<Command> {
        let (&opcode, body) = frame.split_first()?;
        Some(Command {
            opcode,
            body: body.to_vec(),
        })
    }
}

/// One of the three response shapes every dispatched command produces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Ack { opcode: u8, body: Vec<u8> },
    Nack { opcode: u8 },
    Error { opcode: u8, code: ErrorCode },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    MissingParameter = 1,
    UnexpectedException = 2,
    UnknownOrPrecondition = 3,
}

impl Response {
    pub fn ack(opcode: u8, body: impl Into<Vec<u8>>) -> Self {
        Response::Ack {
            opcode,
            body: body.into(),
        }
    }

    pub fn nack(opcode: u8) -> Self {
        Response::Nack { opcode }
    }

    pub fn error(opcode: u8, code: ErrorCode) -> Self {
        Response::Error { opcode, code }
    }

    /// Serializes to the wire body that [`crate::control_codec::encode`]
    /// frames: `0xFE | opcode | body`, `0xFF | opcode`, or
    /// `0xEE | opcode | code`.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Response::Ack { opcode, body } => {
                let mut out = vec![0xFE, *opcode];
                out.extend_from_slice(body);
                out
            }
            Response::Nack { opcode } => vec![0xFF, *opcode],
            Response::Error { opcode, code } => vec![0xEE, *opcode, *code as u8],
        }
    }
}

/// Opcodes understood by the control dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    AttachClient = 0x04,
    DetachClient = 0x05,
    ConnectBle = 0x07,
    DisconnectBle = 0x08,
    BtDisconnected = 0x09,
    StartGateway = 0x0E,
    StopGateway = 0x0F,
    ScanHappDevices = 0x10,
    GetHid = 0x11,
    GetAlias = 0x12,
    SetAlias = 0x13,
    SetPsk = 0x14,
    LeshanRegistered = 0x15,
    LeshanLost = 0x16,
    GetSessionUuid = 0x17,
    GetStatusCode = 0x18,
}

impl Opcode {
    pub fn from_u8(v: u8) -> Option<Self> {
        use Opcode::*;
        Some(match v {
            0x04 => AttachClient,
            0x05 => DetachClient,
            0x07 => ConnectBle,
            0x08 => DisconnectBle,
            0x09 => BtDisconnected,
            0x0E => StartGateway,
            0x0F => StopGateway,
            0x10 => ScanHappDevices,
            0x11 => GetHid,
            0x12 => GetAlias,
            0x13 => SetAlias,
            0x14 => SetPsk,
            0x15 => LeshanRegistered,
            0x16 => LeshanLost,
            0x17 => GetSessionUuid,
            0x18 => GetStatusCode,
            _ => return None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_round_trips() {
        for op in [0x04, 0x05, 0x07, 0x08, 0x09, 0x0E, 0x0F, 0x10, 0x11, 0x12, 0x13, 0x14, 0x15, 0x16, 0x17, 0x18] {
            assert_eq!(Opcode::from_u8(op).map(|o| o as u8), Some(op));
        }
        assert_eq!(Opcode::from_u8(0x06), None);
    }

    #[test]
    fn response_wire_shapes() {
        assert_eq!(Response::ack(0x04, vec![1, 2]).to_bytes(), vec![0xFE, 0x04, 1, 2]);
        assert_eq!(Response::nack(0x07).to_bytes(), vec![0xFF, 0x07]);
        assert_eq!(
            Response::error(0x0E, ErrorCode::UnknownOrPrecondition).to_bytes(),
            vec![0xEE, 0x0E, 3]
        );
    }
}
