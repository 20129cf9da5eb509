/// Size of the packed frame header: `type(1) + address(4) + size(4)`.
pub const FRAME_HEADER_SIZE: usize = 9;

/// Largest frame the peer can reliably parse, header included.
pub const MAX_FRAME_SIZE: usize = 4096;

/// Largest payload a single frame may carry (`MAX_FRAME_SIZE - FRAME_HEADER_SIZE`).
pub const MAX_FRAME_PAYLOAD: usize = MAX_FRAME_SIZE - FRAME_HEADER_SIZE;

/// Length in bytes of an MD5 digest.
pub const DIGEST_LENGTH: usize = 16;

/// Length in ASCII hex characters of an MD5 digest, or of the 32-bit nonce
/// sent during the authentication preamble.
pub const HEX_DIGEST_LENGTH: usize = DIGEST_LENGTH * 2;
pub const HEX_NONCE_LENGTH: usize = 8;

/// Maximum length of a callsign on the wire, newline excluded.
pub const MAX_CALLSIGN_LENGTH: usize = 10;
