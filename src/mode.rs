use std::fmt::{Debug, Formatter};

use bitflags::bitflags;

use crate::error::ChannelError;

bitflags! {
    /// Capabilities requested when opening a channel. The raw bits are sent as the flag of the
    ///  OPEN frame.
    #[derive(PartialEq, Eq, Copy, Clone, Hash)]
    pub struct ChannelMode: u8 {
        const READ  = 0b0000_0001;
        const WRITE = 0b0000_0010;
        const EMIT  = 0b0000_0100;
    }
}

impl ChannelMode {
    /// no capabilities: the channel is opened, but neither reads nor writes nor emits
    pub const LISTEN: ChannelMode = ChannelMode::empty();
    pub const READWRITE: ChannelMode = ChannelMode::READ.union(ChannelMode::WRITE);
    pub const READ_EMIT: ChannelMode = ChannelMode::READ.union(ChannelMode::EMIT);
    pub const WRITE_EMIT: ChannelMode = ChannelMode::WRITE.union(ChannelMode::EMIT);
    pub const READWRITE_EMIT: ChannelMode = ChannelMode::READWRITE.union(ChannelMode::EMIT);

    /// Emitting signals without being able to read or write is not a legal combination.
    pub fn validate(self) -> Result<ChannelMode, ChannelError> {
        if self == ChannelMode::EMIT || ChannelMode::from_bits(self.bits()).is_none() {
            return Err(ChannelError::InvalidMode(self.bits()));
        }
        Ok(self)
    }

    pub fn is_readable(self) -> bool {
        self.contains(ChannelMode::READ)
    }

    pub fn is_writable(self) -> bool {
        self.contains(ChannelMode::WRITE)
    }

    pub fn is_emitable(self) -> bool {
        self.contains(ChannelMode::EMIT)
    }
}

impl TryFrom<u8> for ChannelMode {
    type Error = ChannelError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        ChannelMode::from_bits(value)
            .ok_or(ChannelError::InvalidMode(value))?
            .validate()
    }
}

impl Debug for ChannelMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let r = if self.is_readable() { "r" } else { "-" };
        let w = if self.is_writable() { "w" } else { "-" };
        let e = if self.is_emitable() { "e" } else { "-" };
        write!(f, "{}{}{}", r, w, e)
    }
}

#[cfg(test)]
mod test {
    use rstest::rstest;
    use super::*;

    #[rstest]
    #[case::listen(0, false, false, false)]
    #[case::read(1, true, false, false)]
    #[case::write(2, false, true, false)]
    #[case::readwrite(3, true, true, false)]
    #[case::read_emit(5, true, false, true)]
    #[case::write_emit(6, false, true, true)]
    #[case::readwrite_emit(7, true, true, true)]
    fn test_legal_modes(#[case] raw: u8, #[case] readable: bool, #[case] writable: bool, #[case] emitable: bool) {
        let mode = ChannelMode::try_from(raw).unwrap();
        assert_eq!(mode.bits(), raw);
        assert_eq!(mode.is_readable(), readable);
        assert_eq!(mode.is_writable(), writable);
        assert_eq!(mode.is_emitable(), emitable);
    }

    #[rstest]
    #[case::emit_only(4)]
    #[case::eight(8)]
    #[case::high_bit(0x81)]
    #[case::max(255)]
    fn test_illegal_modes(#[case] raw: u8) {
        assert_eq!(ChannelMode::try_from(raw), Err(ChannelError::InvalidMode(raw)));
    }

    #[test]
    fn test_validate() {
        assert!(ChannelMode::EMIT.validate().is_err());
        assert!(ChannelMode::from_bits_retain(0x09).validate().is_err());
        assert_eq!(ChannelMode::READWRITE_EMIT.validate(), Ok(ChannelMode::READWRITE_EMIT));
    }

    #[rstest]
    #[case::listen(ChannelMode::LISTEN, "---")]
    #[case::rw(ChannelMode::READWRITE, "rw-")]
    #[case::we(ChannelMode::WRITE_EMIT, "-we")]
    fn test_debug(#[case] mode: ChannelMode, #[case] expected: &str) {
        assert_eq!(format!("{:?}", mode), expected);
    }
}
