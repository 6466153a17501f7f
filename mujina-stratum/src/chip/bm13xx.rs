//! BM13xx serial frame codec.
//!
//! Commands to the chip:
//!
//! ```text
//! 55 aa | flags | length | payload ... | crc
//! ```
//!
//! `length` counts everything after the preamble. Register commands end in a
//! CRC5-USB byte; job frames end in a CRC16-CCITT-FALSE, high byte first.
//!
//! Responses from the chip are always 11 bytes:
//!
//! ```text
//! aa 55 | 8 data bytes | type:3 crc:5
//! ```
//!
//! The decoder resynchronizes on garbage by dropping one byte at a time until
//! a frame with a valid preamble and CRC lines up.

use std::io;

use bitvec::prelude::*;
use bytes::{Buf, BufMut, BytesMut};
use crc_all::Crc;
use strum::FromRepr;
use tokio_util::codec::{Decoder, Encoder};

use crate::tracing::{prelude::*, LogConfig};

/// BM1370 chip id, as read from register 0.
pub const BM1370_CHIP_ID: [u8; 2] = [0x13, 0x70];

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr)]
#[repr(u8)]
pub enum RegisterAddress {
    ChipId = 0x00,
    NonceRange = 0x10,
    TicketMask = 0x14,
    MiscControl = 0x18,
    CoreRegister = 0x3c,
    VersionMask = 0xa4,
    InitControl = 0xa8,
}

/// A register value to write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Register {
    ChipId {
        chip_id: [u8; 2],
        core_count: u8,
        address: u8,
    },
    NonceRange([u8; 4]),
    TicketMask([u8; 4]),
    MiscControl(u32),
    CoreRegister(u32),
    /// Which of the 16 rollable version bits (starting at bit 13) the chip
    /// may roll
    VersionMask { mask: u16 },
    InitControl(u32),
}

impl Register {
    /// Ticket mask for a chip-level difficulty.
    ///
    /// The chip only reports nonces meeting the largest power of two not
    /// above `difficulty`. Each byte of the mask goes out bit-reversed.
    pub fn ticket_mask(difficulty: u32) -> Self {
        let power = match difficulty {
            0 | 1 => 1,
            d => 1u32 << (31 - d.leading_zeros()),
        };
        let mask = power - 1;
        let mut bytes = [0u8; 4];
        for (i, byte) in bytes.iter_mut().rev().enumerate() {
            *byte = ((mask >> (8 * i)) as u8).reverse_bits();
        }
        Register::TicketMask(bytes)
    }

    pub fn address(&self) -> RegisterAddress {
        match self {
            Register::ChipId { .. } => RegisterAddress::ChipId,
            Register::NonceRange(_) => RegisterAddress::NonceRange,
            Register::TicketMask(_) => RegisterAddress::TicketMask,
            Register::MiscControl(_) => RegisterAddress::MiscControl,
            Register::CoreRegister(_) => RegisterAddress::CoreRegister,
            Register::VersionMask { .. } => RegisterAddress::VersionMask,
            Register::InitControl(_) => RegisterAddress::InitControl,
        }
    }

    fn put_value(&self, dst: &mut BytesMut) {
        match self {
            Register::ChipId {
                chip_id,
                core_count,
                address,
            } => {
                dst.put_slice(chip_id);
                dst.put_u8(*core_count);
                dst.put_u8(*address);
            }
            Register::NonceRange(bytes) | Register::TicketMask(bytes) => dst.put_slice(bytes),
            Register::MiscControl(value)
            | Register::CoreRegister(value)
            | Register::InitControl(value) => dst.put_u32_le(*value),
            Register::VersionMask { mask } => {
                const ENABLE: u16 = 0x0090;
                dst.put_u16_le(ENABLE);
                dst.put_u16_le(*mask);
            }
        }
    }
}

/// A full block header job, from which the chip derives its own midstates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFrame {
    /// Chip job id, 0..16; echoed in nonce responses
    pub job_id: u8,
    pub starting_nonce: u32,
    pub nbits: u32,
    pub ntime: u32,
    /// Header byte order
    pub merkle_root: [u8; 32],
    /// Header byte order
    pub prev_block_hash: [u8; 32],
    pub version: u32,
}

impl JobFrame {
    const PAYLOAD_LEN: u8 = 82;
    const MIDSTATES: u8 = 1;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    SetChipAddress {
        address: u8,
    },
    ChainInactive,
    ReadRegister {
        all: bool,
        address: u8,
        register: RegisterAddress,
    },
    WriteRegister {
        all: bool,
        address: u8,
        register: Register,
    },
    Job(JobFrame),
}

struct CommandFieldBuilder {
    field: u8,
}

#[repr(u8)]
enum CommandFieldType {
    Job = 1,
    Command = 2,
}

#[repr(u8)]
enum CommandFieldCmd {
    SetAddress = 0,
    WriteRegisterOrJob = 1,
    ReadRegister = 2,
    ChainInactive = 3,
}

impl CommandFieldBuilder {
    fn new() -> Self {
        Self { field: 0 }
    }

    fn with_type(mut self, command_type: CommandFieldType) -> Self {
        let view = self.field.view_bits_mut::<Lsb0>();
        view[5..7].store(command_type as u8);
        self
    }

    fn with_all(mut self, all: bool) -> Self {
        let view = self.field.view_bits_mut::<Lsb0>();
        view[4..5].store(all as u8);
        self
    }

    fn with_cmd(mut self, cmd: CommandFieldCmd) -> Self {
        let view = self.field.view_bits_mut::<Lsb0>();
        view[0..4].store(cmd as u8);
        self
    }

    fn for_command(self, command: &Command) -> Self {
        use CommandFieldCmd as Cmd;
        use CommandFieldType as Type;

        match command {
            Command::SetChipAddress { .. } => self
                .with_type(Type::Command)
                .with_all(false)
                .with_cmd(Cmd::SetAddress),
            Command::ChainInactive => self
                .with_type(Type::Command)
                .with_all(true)
                .with_cmd(Cmd::ChainInactive),
            Command::ReadRegister { all, .. } => self
                .with_type(Type::Command)
                .with_all(*all)
                .with_cmd(Cmd::ReadRegister),
            Command::WriteRegister { all, .. } => self
                .with_type(Type::Command)
                .with_all(*all)
                .with_cmd(Cmd::WriteRegisterOrJob),
            Command::Job(_) => self
                .with_type(Type::Job)
                .with_all(false)
                .with_cmd(Cmd::WriteRegisterOrJob),
        }
    }

    fn build(self) -> u8 {
        self.field
    }
}

pub fn crc5_usb(bytes: &[u8]) -> u8 {
    const POLYNOMIAL: u8 = 0x05;
    const WIDTH: usize = 5;
    const INITIAL: u8 = 0x1f;
    const XOR: u8 = 0;
    const REFLECT: bool = false;
    let mut crc5_usb = Crc::<u8>::new(POLYNOMIAL, WIDTH, INITIAL, XOR, REFLECT);

    crc5_usb.update(bytes);
    crc5_usb.finish()
}

pub fn crc16_ccitt_false(bytes: &[u8]) -> u16 {
    const POLYNOMIAL: u16 = 0x1021;
    const WIDTH: usize = 16;
    const INITIAL: u16 = 0xffff;
    const XOR: u16 = 0;
    const REFLECT: bool = false;
    let mut crc16 = Crc::<u16>::new(POLYNOMIAL, WIDTH, INITIAL, XOR, REFLECT);

    crc16.update(bytes);
    crc16.finish()
}

/// Responses from the chip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    RegisterValue {
        value: [u8; 4],
        chip_address: u8,
        register: u8,
    },
    Nonce {
        nonce: u32,
        midstate: u8,
        /// Chip job id the nonce was found for
        job_id: u8,
        subcore: u8,
        /// Rolled version bits, high byte first on the wire; shifted left by
        /// 13 to land in the block version
        version_bits: u16,
    },
}

impl Response {
    /// The chip id, if this is a read of register 0.
    pub fn chip_id(&self) -> Option<[u8; 2]> {
        match self {
            Response::RegisterValue {
                value,
                register: 0,
                ..
            } => Some([value[0], value[1]]),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
pub struct FrameCodec {
    log: LogConfig,
}

impl FrameCodec {
    pub fn new(log: LogConfig) -> Self {
        Self { log }
    }
}

impl Encoder<Command> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, command: Command, dst: &mut BytesMut) -> Result<(), Self::Error> {
        const COMMAND_PREAMBLE: &[u8] = &[0x55, 0xaa];
        let start = dst.len();
        dst.put_slice(COMMAND_PREAMBLE);

        let command_field = CommandFieldBuilder::new().for_command(&command).build();
        dst.put_u8(command_field);

        match &command {
            Command::SetChipAddress { address } => {
                const LENGTH: u8 = 5;
                dst.put_u8(LENGTH);
                dst.put_u8(*address);
                dst.put_u8(0);
            }
            Command::ChainInactive => {
                const LENGTH: u8 = 5;
                dst.put_u8(LENGTH);
                dst.put_u8(0);
                dst.put_u8(0);
            }
            Command::ReadRegister {
                address, register, ..
            } => {
                const LENGTH: u8 = 5;
                dst.put_u8(LENGTH);
                dst.put_u8(*address);
                dst.put_u8(*register as u8);
            }
            Command::WriteRegister {
                address, register, ..
            } => {
                const LENGTH: u8 = 9;
                dst.put_u8(LENGTH);
                dst.put_u8(*address);
                dst.put_u8(register.address() as u8);
                register.put_value(dst);
            }
            Command::Job(job) => {
                // flags + length + payload + crc16
                const LENGTH: u8 = 1 + 1 + JobFrame::PAYLOAD_LEN + 2;
                dst.put_u8(LENGTH);
                dst.put_u8(job.job_id);
                dst.put_u8(JobFrame::MIDSTATES);
                dst.put_u32_le(job.starting_nonce);
                dst.put_u32_le(job.nbits);
                dst.put_u32_le(job.ntime);
                dst.put_slice(&job.merkle_root);
                dst.put_slice(&job.prev_block_hash);
                dst.put_u32_le(job.version);
            }
        }

        let body = &dst[start + COMMAND_PREAMBLE.len()..];
        match command {
            Command::Job(_) => {
                let crc = crc16_ccitt_false(body);
                dst.put_u16(crc);
            }
            _ => {
                let crc = crc5_usb(body);
                dst.put_u8(crc);
            }
        }

        if self.log.raw_traffic() {
            trace!(frame = %hex::encode(&dst[start..]), "TX");
        }

        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = Response;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Returning an error terminates the stream, so bad bytes are skipped
        // one at a time and the caller is asked to try again.
        const PREAMBLE: &[u8] = &[0xaa, 0x55];
        const FRAME_LEN: usize = 11;
        const REGISTER_RESPONSE: u8 = 0;
        const NONCE_RESPONSE: u8 = 4;

        loop {
            if src.len() < FRAME_LEN {
                return Ok(None);
            }

            if &src[..2] != PREAMBLE || crc5_usb(&src[2..FRAME_LEN]) != 0 {
                src.advance(1);
                continue;
            }

            let frame = src.split_to(FRAME_LEN);
            if self.log.raw_traffic() {
                trace!(frame = %hex::encode(&frame), "RX");
            }

            let mut body = &frame[2..FRAME_LEN - 1];
            let kind = frame[FRAME_LEN - 1] >> 5;

            match kind {
                REGISTER_RESPONSE => {
                    let mut value = [0u8; 4];
                    body.copy_to_slice(&mut value);
                    let chip_address = body.get_u8();
                    let register = body.get_u8();
                    return Ok(Some(Response::RegisterValue {
                        value,
                        chip_address,
                        register,
                    }));
                }
                NONCE_RESPONSE => {
                    let nonce = body.get_u32_le();
                    let midstate = body.get_u8();
                    let result_header = body.get_u8();
                    let version_bits = body.get_u16();
                    return Ok(Some(Response::Nonce {
                        nonce,
                        midstate,
                        job_id: result_header >> 4,
                        subcore: result_header & 0x0f,
                        version_bits,
                    }));
                }
                other => {
                    debug!(kind = other, "Unknown response type from chip");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn as_hex(bytes: &[u8]) -> String {
        bytes
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect::<Vec<String>>()
            .join(" ")
    }

    fn assert_frame(cmd: Command, expect: &[u8]) {
        let mut codec = FrameCodec::default();
        let mut frame = BytesMut::new();
        codec.encode(cmd, &mut frame).unwrap();
        if frame != expect {
            panic!(
                "mismatch!\nexpected: {}\nactual: {}",
                as_hex(expect),
                as_hex(&frame[..])
            )
        }
    }

    fn decode_all(wire: &[u8]) -> Vec<Response> {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::from(wire);
        let mut out = Vec::new();
        while let Some(response) = codec.decode(&mut buf).unwrap() {
            out.push(response);
        }
        out
    }

    const CHIP_ID_RESPONSE: [u8; 11] = [0xaa, 0x55, 0x13, 0x70, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x10];
    const NONCE_RESPONSE: [u8; 11] = [0xaa, 0x55, 0x18, 0x00, 0xa6, 0x40, 0x02, 0x99, 0x22, 0xf9, 0x91];

    #[test_case(&[0x52, 0x05, 0x00, 0x00], 0x0a; "read register")]
    #[test_case(&[0x53, 0x05, 0x00, 0x00], 0x03; "chain inactive")]
    #[test_case(&[0x51, 0x09, 0x00, 0x14, 0x00, 0x00, 0x00, 0xff], 0x08; "ticket mask")]
    fn crc5(body: &[u8], expect: u8) {
        assert_eq!(crc5_usb(body), expect);
    }

    #[test]
    fn crc16_check_value() {
        assert_eq!(crc16_ccitt_false(b"123456789"), 0x29b1);
    }

    #[test]
    fn test_read_all() {
        assert_frame(
            Command::ReadRegister {
                all: true,
                address: 0,
                register: RegisterAddress::ChipId,
            },
            &[0x55, 0xaa, 0x52, 0x05, 0x00, 0x00, 0x0a],
        );
    }

    #[test]
    fn chain_inactive() {
        assert_frame(
            Command::ChainInactive,
            &[0x55, 0xaa, 0x53, 0x05, 0x00, 0x00, 0x03],
        );
    }

    #[test]
    fn set_chip_address() {
        assert_frame(
            Command::SetChipAddress { address: 0x04 },
            &[0x55, 0xaa, 0x40, 0x05, 0x04, 0x00, 0x03],
        );
    }

    #[test_case(Register::VersionMask { mask: 0xffff }, &[0x51, 0x09, 0x00, 0xa4, 0x90, 0x00, 0xff, 0xff, 0x1c]; "version mask")]
    #[test_case(Register::InitControl(0x0000_0700), &[0x51, 0x09, 0x00, 0xa8, 0x00, 0x07, 0x00, 0x00, 0x03]; "init control")]
    #[test_case(Register::MiscControl(0x00c1_00f0), &[0x51, 0x09, 0x00, 0x18, 0xf0, 0x00, 0xc1, 0x00, 0x04]; "misc control")]
    #[test_case(Register::CoreRegister(0x008b_0080), &[0x51, 0x09, 0x00, 0x3c, 0x80, 0x00, 0x8b, 0x00, 0x12]; "core register")]
    #[test_case(Register::ticket_mask(256), &[0x51, 0x09, 0x00, 0x14, 0x00, 0x00, 0x00, 0xff, 0x08]; "ticket mask 256")]
    fn broadcast_write(register: Register, body: &[u8]) {
        let mut expect = vec![0x55, 0xaa];
        expect.extend_from_slice(body);
        assert_frame(
            Command::WriteRegister {
                all: true,
                address: 0,
                register,
            },
            &expect,
        );
    }

    #[test]
    fn write_chip_id_to_one_chip() {
        assert_frame(
            Command::WriteRegister {
                all: false,
                address: 0x01,
                register: Register::ChipId {
                    chip_id: BM1370_CHIP_ID,
                    core_count: 0,
                    address: 0x01,
                },
            },
            &[0x55, 0xaa, 0x41, 0x09, 0x01, 0x00, 0x13, 0x70, 0x00, 0x01, 0x0a],
        );
    }

    #[test_case(1, [0x00, 0x00, 0x00, 0x00]; "one")]
    #[test_case(300, [0x00, 0x00, 0x00, 0xff]; "rounds down")]
    #[test_case(1024, [0x00, 0x00, 0xc0, 0xff]; "ten bits")]
    fn ticket_mask(difficulty: u32, expect: [u8; 4]) {
        assert_eq!(Register::ticket_mask(difficulty), Register::TicketMask(expect));
    }

    #[test]
    fn job_frame_layout() {
        let job = JobFrame {
            job_id: 3,
            starting_nonce: 0,
            nbits: 0x170e_d66a,
            ntime: 0x6673_8c20,
            merkle_root: [0xaa; 32],
            prev_block_hash: [0xbb; 32],
            version: 0x2000_0000,
        };

        let mut codec = FrameCodec::default();
        let mut frame = BytesMut::new();
        codec.encode(Command::Job(job), &mut frame).unwrap();

        assert_eq!(frame.len(), 88);
        assert_eq!(&frame[..4], &[0x55, 0xaa, 0x21, 86]);
        assert_eq!(&frame[4..6], &[3, 1]);
        assert_eq!(&frame[6..10], &[0, 0, 0, 0]);
        assert_eq!(&frame[10..14], &[0x6a, 0xd6, 0x0e, 0x17]);
        assert_eq!(&frame[14..18], &[0x20, 0x8c, 0x73, 0x66]);
        assert_eq!(&frame[18..50], &[0xaa; 32]);
        assert_eq!(&frame[50..82], &[0xbb; 32]);
        assert_eq!(&frame[82..86], &[0x00, 0x00, 0x00, 0x20]);

        let crc = crc16_ccitt_false(&frame[2..86]);
        assert_eq!(&frame[86..], &crc.to_be_bytes());
    }

    #[test]
    fn decode_chip_id() {
        let responses = decode_all(&CHIP_ID_RESPONSE);
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].chip_id(), Some(BM1370_CHIP_ID));
    }

    #[test]
    fn decode_nonce() {
        assert_eq!(
            decode_all(&NONCE_RESPONSE),
            vec![Response::Nonce {
                nonce: 0x40a6_0018,
                midstate: 0x02,
                job_id: 9,
                subcore: 9,
                version_bits: 0x22f9,
            }]
        );
    }

    #[test]
    fn decode_resyncs_after_garbage() {
        let mut wire = vec![0x00, 0xaa, 0x13];
        wire.extend_from_slice(&CHIP_ID_RESPONSE);
        // Preamble with a corrupt body
        wire.extend_from_slice(&[0xaa, 0x55, 0x13, 0x70, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0xff]);
        wire.extend_from_slice(&NONCE_RESPONSE);

        let responses = decode_all(&wire);
        assert_eq!(responses.len(), 2);
        assert!(responses[0].chip_id().is_some());
        assert!(matches!(responses[1], Response::Nonce { job_id: 9, .. }));
    }

    #[test]
    fn decode_waits_for_full_frame() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::from(&NONCE_RESPONSE[..6]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        assert_eq!(buf.len(), 6);

        buf.extend_from_slice(&NONCE_RESPONSE[6..]);
        assert!(codec.decode(&mut buf).unwrap().is_some());
        assert!(buf.is_empty());
    }
}
