//! Structural checks on peer-supplied yrs v1 payloads.
//!
//! yrs sizes some of its buffers straight from counts read off the wire, so a
//! few bytes can ask for gigabytes. Everything here walks the payload once,
//! allocation free, and refuses any count that cannot fit in the bytes left.
//! Only inputs that pass are handed to `decode_v1`.

/// Nesting limit for `Any` values.
const MAX_DEPTH: usize = 128;

// Block info values and flags of the v1 update format
const BLOCK_GC: u8 = 0;
const BLOCK_SKIP: u8 = 10;
const HAS_ORIGIN: u8 = 0b1000_0000;
const HAS_RIGHT_ORIGIN: u8 = 0b0100_0000;
const HAS_PARENT_SUB: u8 = 0b0010_0000;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub(crate) enum BoundsError {
    #[error("Unexpected end of input at byte {0}")]
    Truncated(usize),
    #[error("Varint at byte {0} is too long")]
    VarintTooLong(usize),
    #[error("Count {count} at byte {at} cannot fit in the {remaining} bytes left")]
    CountTooLarge {
        at: usize,
        count: u64,
        remaining: usize,
    },
    #[error("Unknown tag {tag} at byte {at}")]
    UnknownTag { at: usize, tag: u8 },
    #[error("Invalid UTF-8 in string at byte {0}")]
    InvalidUtf8(usize),
    #[error("Value nested deeper than {} levels", MAX_DEPTH)]
    TooDeep,
}

type Result<T> = std::result::Result<T, BoundsError>;

/// Check an encoded state vector: a count of (client, clock) pairs.
pub(crate) fn check_state_vector(bytes: &[u8]) -> Result<()> {
    let mut r = Reader::new(bytes);
    let entries = r.count_u32(2)?;
    for _ in 0..entries {
        r.skip_var()?;
        r.skip_var()?;
    }
    Ok(())
}

/// Check an encoded update: per-client block runs followed by a delete set.
pub(crate) fn check_update(bytes: &[u8]) -> Result<()> {
    let mut r = Reader::new(bytes);

    let clients = r.count_u32(3)?;
    for _ in 0..clients {
        let blocks = r.count_u32(1)?;
        r.skip_var()?; // client
        r.skip_var()?; // clock
        for _ in 0..blocks {
            block(&mut r)?;
        }
    }

    let deleted_clients = r.count_u32(2)?;
    for _ in 0..deleted_clients {
        r.skip_var()?; // client
        let ranges = r.count_u32(2)?;
        for _ in 0..ranges {
            r.skip_var()?; // clock
            r.skip_var()?; // len
        }
    }
    Ok(())
}

fn block(r: &mut Reader<'_>) -> Result<()> {
    let at = r.pos;
    let info = r.u8()?;
    if info == BLOCK_GC || info == BLOCK_SKIP {
        return r.skip_var();
    }

    if info & HAS_ORIGIN != 0 {
        r.skip_id()?;
    }
    if info & HAS_RIGHT_ORIGIN != 0 {
        r.skip_id()?;
    }
    if info & (HAS_ORIGIN | HAS_RIGHT_ORIGIN) == 0 {
        if r.var_u32()? == 1 {
            r.string()?; // named root
        } else {
            r.skip_id()?;
        }
        if info & HAS_PARENT_SUB != 0 {
            r.string()?;
        }
    }
    content(r, info & 0b1111, at)
}

fn content(r: &mut Reader<'_>, kind: u8, at: usize) -> Result<()> {
    match kind {
        // Deleted
        1 => r.skip_var(),
        // JSON: the count is one less than the strings that follow
        2 => {
            let strings = r.count_u32(1)?;
            for _ in 0..=strings {
                r.string()?;
            }
            Ok(())
        }
        // Binary, String, Embed
        3 | 4 | 5 => r.string_or_buf(kind == 3),
        // Format
        6 => {
            r.string()?;
            r.string()
        }
        // Nested type
        7 => {
            let at = r.pos;
            match r.u8()? {
                3 => r.string(), // element name
                0 | 1 | 2 | 4 | 5 | 6 | 9 | 15 => Ok(()),
                tag => Err(BoundsError::UnknownTag { at, tag }),
            }
        }
        8 => {
            let values = r.count_u32(1)?;
            for _ in 0..values {
                any(r, 0)?;
            }
            Ok(())
        }
        // Subdocument: guid and options
        9 => {
            r.string()?;
            any(r, 0)
        }
        // Move: bit 0 of the flags marks a collapsed range with no end id
        11 => {
            let flags = r.u8_then_skip_var()?;
            r.skip_id()?;
            if flags & 1 == 0 {
                r.skip_id()?;
            }
            Ok(())
        }
        tag => Err(BoundsError::UnknownTag { at, tag }),
    }
}

fn any(r: &mut Reader<'_>, depth: usize) -> Result<()> {
    if depth >= MAX_DEPTH {
        return Err(BoundsError::TooDeep);
    }
    let at = r.pos;
    match r.u8()? {
        // undefined, null, false, true
        127 | 126 | 121 | 120 => Ok(()),
        125 => r.skip_var(),
        124 => r.skip(4),
        123 | 122 => r.skip(8),
        119 => r.string(),
        118 => {
            let entries = r.count_u64(2)?;
            for _ in 0..entries {
                r.string()?;
                any(r, depth + 1)?;
            }
            Ok(())
        }
        117 => {
            let items = r.count_u64(1)?;
            for _ in 0..items {
                any(r, depth + 1)?;
            }
            Ok(())
        }
        116 => r.string_or_buf(true),
        tag => Err(BoundsError::UnknownTag { at, tag }),
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn u8(&mut self) -> Result<u8> {
        let byte = *self
            .buf
            .get(self.pos)
            .ok_or(BoundsError::Truncated(self.pos))?;
        self.pos += 1;
        Ok(byte)
    }

    fn skip(&mut self, n: usize) -> Result<()> {
        if n > self.remaining() {
            return Err(BoundsError::Truncated(self.buf.len()));
        }
        self.pos += n;
        Ok(())
    }

    /// Unsigned varint accumulated the way the decoder does at `bits` width:
    /// shifts wrap and at most eleven bytes are accepted.
    fn var(&mut self, bits: u32) -> Result<u64> {
        let start = self.pos;
        let mut value: u64 = 0;
        let mut shift: u32 = 0;
        loop {
            let byte = self.u8()?;
            let part = u64::from(byte & 0x7f);
            value |= if bits == 32 {
                u64::from((part as u32).wrapping_shl(shift))
            } else {
                part.wrapping_shl(shift)
            };
            shift += 7;
            if byte & 0x80 == 0 {
                return Ok(if bits == 32 { value & 0xffff_ffff } else { value });
            }
            if shift > 70 {
                return Err(BoundsError::VarintTooLong(start));
            }
        }
    }

    fn var_u32(&mut self) -> Result<u64> {
        self.var(32)
    }

    /// Signed and unsigned varints end on the same continuation bit.
    fn skip_var(&mut self) -> Result<()> {
        self.var(64).map(|_| ())
    }

    /// First byte of a varint, after consuming all of it.
    fn u8_then_skip_var(&mut self) -> Result<u8> {
        let first = *self
            .buf
            .get(self.pos)
            .ok_or(BoundsError::Truncated(self.pos))?;
        self.skip_var()?;
        Ok(first)
    }

    fn skip_id(&mut self) -> Result<()> {
        self.skip_var()?;
        self.skip_var()
    }

    fn count_u32(&mut self, min_item_len: usize) -> Result<u64> {
        let at = self.pos;
        let count = self.var_u32()?;
        self.fits(at, count, min_item_len)
    }

    fn count_u64(&mut self, min_item_len: usize) -> Result<u64> {
        let at = self.pos;
        let count = self.var(64)?;
        self.fits(at, count, min_item_len)
    }

    fn fits(&self, at: usize, count: u64, min_item_len: usize) -> Result<u64> {
        let remaining = self.remaining();
        if count > (remaining / min_item_len) as u64 {
            return Err(BoundsError::CountTooLarge {
                at,
                count,
                remaining,
            });
        }
        Ok(count)
    }

    fn string(&mut self) -> Result<()> {
        self.string_or_buf(false)
    }

    /// Length-prefixed bytes; strings must also be valid UTF-8.
    fn string_or_buf(&mut self, raw: bool) -> Result<()> {
        let at = self.pos;
        let len = self.var(64)?;
        let len = usize::try_from(len)
            .ok()
            .filter(|len| *len <= self.remaining())
            .ok_or(BoundsError::Truncated(self.buf.len()))?;
        let bytes = &self.buf[self.pos..self.pos + len];
        if !raw && std::str::from_utf8(bytes).is_err() {
            return Err(BoundsError::InvalidUtf8(at));
        }
        self.pos += len;
        Ok(())
    }
}
