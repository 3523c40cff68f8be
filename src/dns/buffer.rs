//! buffers for use when writing and reading dns packets

use std::collections::HashMap;

use derive_more::{Display, Error, From};

#[derive(Debug, Display, From, Error)]
pub enum BufferError {
    Io(std::io::Error),
    #[display(fmt = "end of buffer reached at offset {}", offset)]
    #[from(ignore)]
    EndOfBuffer { offset: usize },
    #[display(fmt = "read past the end of the record data at offset {}", offset)]
    #[from(ignore)]
    EndOfRecord { offset: usize },
    #[display(
        fmt = "compression pointer at offset {} targets offset {} which is not strictly earlier",
        offset,
        target
    )]
    #[from(ignore)]
    BadPointer { offset: usize, target: usize },
    #[display(fmt = "reserved label type 0x{:02x} at offset {}", label_type, offset)]
    #[from(ignore)]
    ReservedLabel { offset: usize, label_type: u8 },
    #[display(fmt = "label `{}` exceeds 63 octets", label)]
    #[from(ignore)]
    LabelTooLong { label: String },
    #[display(fmt = "empty label in `{}`", name)]
    #[from(ignore)]
    EmptyLabel { name: String },
    #[display(fmt = "bad escape sequence in `{}`", name)]
    #[from(ignore)]
    BadEscape { name: String },
    #[display(fmt = "domain name exceeds 255 octets at offset {}", offset)]
    #[from(ignore)]
    NameTooLong { offset: usize },
    #[display(fmt = "record limit {} is beyond the current limit {}", end, limit)]
    #[from(ignore)]
    BadLimit { end: usize, limit: usize },
    ReadOnly,
}

type Result<T> = std::result::Result<T, BufferError>;

/// Longest encoded name permitted on the wire, root label included
pub const MAX_NAME_LEN: usize = 255;

/// Longest single label
pub const MAX_LABEL_LEN: usize = 63;

/// Compression pointers carry 14 bits of offset
const MAX_POINTER_OFFSET: usize = 0x3FFF;

/// Sequential access to a DNS packet.
///
/// Reads go through `read`, which honours the innermost limit installed by
/// `push_limit`. That is how RDATA is parsed under its RDLENGTH: a record
/// decoder that tries to read past its data fails instead of consuming the
/// next record. Absolute access through `get` and `get_range` ignores the
/// limit, since compression pointers inside RDATA legitimately reach back
/// into earlier parts of the message.
pub trait PacketBuffer {
    fn read(&mut self) -> Result<u8>;
    fn get(&self, pos: usize) -> Result<u8>;
    fn get_range(&self, start: usize, len: usize) -> Result<&[u8]>;
    fn write(&mut self, val: u8) -> Result<()>;
    fn set(&mut self, pos: usize, val: u8) -> Result<()>;
    fn pos(&self) -> usize;
    fn seek(&mut self, pos: usize) -> Result<()>;
    fn len(&self) -> usize;

    /// Current read limit, which is the buffer length when no limit is active
    fn limit(&self) -> usize;
    fn push_limit(&mut self, end: usize) -> Result<()>;
    fn pop_limit(&mut self);

    fn find_label(&self, label: &str) -> Option<usize>;
    fn save_label(&mut self, label: &str, pos: usize);

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn remaining(&self) -> usize {
        self.limit().saturating_sub(self.pos())
    }

    fn step(&mut self, steps: usize) -> Result<()> {
        let target = self.pos() + steps;
        if target > self.limit() {
            return Err(BufferError::EndOfRecord { offset: target });
        }
        self.seek(target)
    }

    fn read_u16(&mut self) -> Result<u16> {
        let hi = self.read()? as u16;
        let lo = self.read()? as u16;
        Ok((hi << 8) | lo)
    }

    fn read_u32(&mut self) -> Result<u32> {
        let hi = self.read_u16()? as u32;
        let lo = self.read_u16()? as u32;
        Ok((hi << 16) | lo)
    }

    /// Reads the 48 bit integers used for TSIG timestamps
    fn read_u48(&mut self) -> Result<u64> {
        let hi = self.read_u16()? as u64;
        let lo = self.read_u32()? as u64;
        Ok((hi << 32) | lo)
    }

    fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>> {
        let start = self.pos();
        if start + len > self.limit() {
            return Err(BufferError::EndOfRecord { offset: start + len });
        }
        let bytes = self.get_range(start, len)?.to_vec();
        self.seek(start + len)?;
        Ok(bytes)
    }

    fn write_u8(&mut self, val: u8) -> Result<()> {
        self.write(val)
    }

    fn write_u16(&mut self, val: u16) -> Result<()> {
        self.write((val >> 8) as u8)?;
        self.write((val & 0xFF) as u8)
    }

    fn write_u32(&mut self, val: u32) -> Result<()> {
        self.write_u16((val >> 16) as u16)?;
        self.write_u16((val & 0xFFFF) as u16)
    }

    fn write_u48(&mut self, val: u64) -> Result<()> {
        self.write_u16(((val >> 32) & 0xFFFF) as u16)?;
        self.write_u32((val & 0xFFFF_FFFF) as u32)
    }

    fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        for b in bytes {
            self.write(*b)?;
        }
        Ok(())
    }

    fn set_u16(&mut self, pos: usize, val: u16) -> Result<()> {
        self.set(pos, (val >> 8) as u8)?;
        self.set(pos + 1, (val & 0xFF) as u8)
    }

    /// Reads a domain name, following compression pointers.
    ///
    /// Every pointer has to reference an offset strictly lower than its own
    /// position, so the walk always terminates. The buffer position ends up
    /// just past the name as it appears inline, i.e. after the first pointer
    /// if one was followed. Labels are rendered in zone file notation, so a
    /// dot or a non-printable byte inside a label survives `write_qname`.
    fn read_qname(&mut self, outstr: &mut String) -> Result<()> {
        // Some(pos) once a pointer has been followed; from then on we read
        // through absolute offsets and leave the buffer position alone
        let mut cursor: Option<usize> = None;
        let mut wire_len = 0;
        let mut delim = "";

        loop {
            let at = cursor.unwrap_or_else(|| self.pos());
            let len = match cursor {
                None => self.read()?,
                Some(p) => self.get(p)?,
            };

            match len & 0xC0 {
                0xC0 => {
                    let lo = match cursor {
                        None => self.read()?,
                        Some(p) => self.get(p + 1)?,
                    };
                    let target = ((((len ^ 0xC0) as u16) << 8) | lo as u16) as usize;
                    if target >= at {
                        return Err(BufferError::BadPointer { offset: at, target });
                    }
                    cursor = Some(target);
                }
                0x00 => {
                    wire_len += len as usize + 1;
                    if wire_len > MAX_NAME_LEN {
                        return Err(BufferError::NameTooLong { offset: at });
                    }

                    if len == 0 {
                        break;
                    }

                    let label = match cursor {
                        None => self.read_bytes(len as usize)?,
                        Some(p) => {
                            let label = self.get_range(p + 1, len as usize)?.to_vec();
                            cursor = Some(p + 1 + len as usize);
                            label
                        }
                    };

                    outstr.push_str(delim);
                    push_label(outstr, &label);
                    delim = ".";
                }
                label_type => {
                    return Err(BufferError::ReservedLabel {
                        offset: at,
                        label_type,
                    });
                }
            }
        }

        Ok(())
    }

    /// Writes a domain name as a sequence of labels.
    ///
    /// With `compress` set, any suffix already written to this buffer is
    /// replaced by a pointer to it, and every new suffix is remembered for
    /// later names. Canonical output (signatures) passes `compress = false`.
    /// `\.`, `\\` and `\DDD` escapes are turned back into raw bytes.
    fn write_qname(&mut self, qname: &str, compress: bool, lowercase: bool) -> Result<()> {
        if qname.is_empty() || qname == "." {
            return self.write_u8(0);
        }

        let mut labels = parse_labels(qname)?;
        // a trailing dot only marks the name as absolute
        if labels.len() > 1 && labels.last().map_or(false, Vec::is_empty) {
            labels.pop();
        }

        let mut wire_len = 1;
        for label in &labels {
            if label.is_empty() {
                return Err(BufferError::EmptyLabel {
                    name: qname.to_string(),
                });
            }
            if label.len() > MAX_LABEL_LEN {
                return Err(BufferError::LabelTooLong {
                    label: String::from_utf8_lossy(label).into_owned(),
                });
            }
            wire_len += label.len() + 1;
        }
        if wire_len > MAX_NAME_LEN {
            return Err(BufferError::NameTooLong { offset: self.pos() });
        }

        for (i, label) in labels.iter().enumerate() {
            if compress {
                let suffix = suffix_key(&labels[i..]);
                if let Some(offset) = self.find_label(&suffix) {
                    return self.write_u16(0xC000 | offset as u16);
                }

                let pos = self.pos();
                if pos <= MAX_POINTER_OFFSET {
                    self.save_label(&suffix, pos);
                }
            }

            self.write_u8(label.len() as u8)?;
            for &b in label {
                self.write_u8(if lowercase { b.to_ascii_lowercase() } else { b })?;
            }
        }

        self.write_u8(0)
    }
}

/// Appends a label in zone file notation. Dots and backslashes inside the
/// label are escaped, bytes outside printable ASCII become `\DDD`.
fn push_label(out: &mut String, label: &[u8]) {
    for &b in label {
        match b {
            b'.' | b'\\' => {
                out.push('\\');
                out.push(b as char);
            }
            0x21..=0x7E => out.push(b as char),
            _ => out.push_str(&format!("\\{:03}", b)),
        }
    }
}

/// Splits a name in zone file notation into raw labels, undoing the escapes
/// written by `push_label`
fn parse_labels(name: &str) -> Result<Vec<Vec<u8>>> {
    let bad_escape = || BufferError::BadEscape {
        name: name.to_string(),
    };

    let mut labels = Vec::new();
    let mut label = Vec::new();
    let mut bytes = name.bytes();
    while let Some(b) = bytes.next() {
        match b {
            b'.' => labels.push(std::mem::take(&mut label)),
            b'\\' => {
                let first = bytes.next().ok_or_else(bad_escape)?;
                if !first.is_ascii_digit() {
                    label.push(first);
                    continue;
                }

                let mut value = u32::from(first - b'0');
                for _ in 0..2 {
                    match bytes.next() {
                        Some(d) if d.is_ascii_digit() => value = value * 10 + u32::from(d - b'0'),
                        _ => return Err(bad_escape()),
                    }
                }
                label.push(u8::try_from(value).map_err(|_| bad_escape())?);
            }
            _ => label.push(b),
        }
    }
    labels.push(label);

    Ok(labels)
}

/// Case-insensitive key of a name suffix for the compression table
fn suffix_key(labels: &[Vec<u8>]) -> String {
    let mut key = String::new();
    for (i, label) in labels.iter().enumerate() {
        if i > 0 {
            key.push('.');
        }
        push_label(&mut key, label);
    }
    key.make_ascii_lowercase();
    key
}

/// A growable buffer, used for assembling outgoing packets
#[derive(Default, Debug, Clone)]
pub struct VectorPacketBuffer {
    pub buffer: Vec<u8>,
    pub pos: usize,
    pub label_lookup: HashMap<String, usize>,
    limits: Vec<usize>,
}

impl VectorPacketBuffer {
    pub fn new() -> VectorPacketBuffer {
        VectorPacketBuffer {
            buffer: Vec::new(),
            pos: 0,
            label_lookup: HashMap::new(),
            limits: Vec::new(),
        }
    }

    pub fn from_bytes(bytes: Vec<u8>) -> VectorPacketBuffer {
        VectorPacketBuffer {
            buffer: bytes,
            ..VectorPacketBuffer::new()
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buffer
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buffer
    }
}

impl PacketBuffer for VectorPacketBuffer {
    fn find_label(&self, label: &str) -> Option<usize> {
        self.label_lookup.get(label).cloned()
    }

    fn save_label(&mut self, label: &str, pos: usize) {
        self.label_lookup.insert(label.to_string(), pos);
    }

    fn read(&mut self) -> Result<u8> {
        if self.pos >= self.limit() {
            return Err(limit_error(self.pos, self.buffer.len(), &self.limits));
        }
        let res = self.buffer[self.pos];
        self.pos += 1;

        Ok(res)
    }

    fn get(&self, pos: usize) -> Result<u8> {
        self.buffer
            .get(pos)
            .copied()
            .ok_or(BufferError::EndOfBuffer { offset: pos })
    }

    fn get_range(&self, start: usize, len: usize) -> Result<&[u8]> {
        self.buffer
            .get(start..start + len)
            .ok_or(BufferError::EndOfBuffer { offset: start + len })
    }

    fn write(&mut self, val: u8) -> Result<()> {
        if self.pos < self.buffer.len() {
            self.buffer[self.pos] = val;
        } else {
            self.buffer.push(val);
        }
        self.pos += 1;
        Ok(())
    }

    fn set(&mut self, pos: usize, val: u8) -> Result<()> {
        match self.buffer.get_mut(pos) {
            Some(slot) => {
                *slot = val;
                Ok(())
            }
            None => Err(BufferError::EndOfBuffer { offset: pos }),
        }
    }

    fn pos(&self) -> usize {
        self.pos
    }

    fn seek(&mut self, pos: usize) -> Result<()> {
        if pos > self.buffer.len() {
            return Err(BufferError::EndOfBuffer { offset: pos });
        }
        self.pos = pos;
        Ok(())
    }

    fn len(&self) -> usize {
        self.buffer.len()
    }

    fn limit(&self) -> usize {
        self.limits.last().copied().unwrap_or(self.buffer.len())
    }

    fn push_limit(&mut self, end: usize) -> Result<()> {
        let limit = self.limit();
        if end > limit {
            return Err(BufferError::BadLimit { end, limit });
        }
        self.limits.push(end);
        Ok(())
    }

    fn pop_limit(&mut self) {
        self.limits.pop();
    }
}

/// A read-only view over a packet received from the network
#[derive(Debug, Clone)]
pub struct BytePacketBuffer<'a> {
    pub buf: &'a [u8],
    pub pos: usize,
    limits: Vec<usize>,
}

impl<'a> BytePacketBuffer<'a> {
    pub fn new(buf: &'a [u8]) -> BytePacketBuffer<'a> {
        BytePacketBuffer {
            buf,
            pos: 0,
            limits: Vec::new(),
        }
    }
}

impl<'a> PacketBuffer for BytePacketBuffer<'a> {
    fn find_label(&self, _: &str) -> Option<usize> {
        None
    }

    fn save_label(&mut self, _: &str, _: usize) {}

    fn read(&mut self) -> Result<u8> {
        if self.pos >= self.limit() {
            return Err(limit_error(self.pos, self.buf.len(), &self.limits));
        }
        let res = self.buf[self.pos];
        self.pos += 1;

        Ok(res)
    }

    fn get(&self, pos: usize) -> Result<u8> {
        self.buf
            .get(pos)
            .copied()
            .ok_or(BufferError::EndOfBuffer { offset: pos })
    }

    fn get_range(&self, start: usize, len: usize) -> Result<&[u8]> {
        self.buf
            .get(start..start + len)
            .ok_or(BufferError::EndOfBuffer { offset: start + len })
    }

    fn write(&mut self, _: u8) -> Result<()> {
        Err(BufferError::ReadOnly)
    }

    fn set(&mut self, _: usize, _: u8) -> Result<()> {
        Err(BufferError::ReadOnly)
    }

    fn pos(&self) -> usize {
        self.pos
    }

    fn seek(&mut self, pos: usize) -> Result<()> {
        if pos > self.buf.len() {
            return Err(BufferError::EndOfBuffer { offset: pos });
        }
        self.pos = pos;
        Ok(())
    }

    fn len(&self) -> usize {
        self.buf.len()
    }

    fn limit(&self) -> usize {
        self.limits.last().copied().unwrap_or(self.buf.len())
    }

    fn push_limit(&mut self, end: usize) -> Result<()> {
        let limit = self.limit();
        if end > limit {
            return Err(BufferError::BadLimit { end, limit });
        }
        self.limits.push(end);
        Ok(())
    }

    fn pop_limit(&mut self) {
        self.limits.pop();
    }
}

fn limit_error(pos: usize, len: usize, limits: &[usize]) -> BufferError {
    match limits.last() {
        Some(_) if pos < len => BufferError::EndOfRecord { offset: pos },
        _ => BufferError::EndOfBuffer { offset: pos },
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn test_qname_roundtrip() {
        let mut buffer = VectorPacketBuffer::new();

        let instr1 = "a.google.com".to_string();
        let instr2 = "b.google.com".to_string();

        // First write the standard string
        buffer.write_qname(&instr1, true, false).unwrap();

        // Then we set up a slight variation with relies on a jump back to the data of
        // the first name
        let crafted_data = [0x01, b'b', 0xC0, 0x02];
        for b in &crafted_data {
            buffer.write_u8(*b).unwrap();
        }

        // Basic sanity check on what the buffer contains
        assert_eq!(14, buffer.pos());
        assert_eq!(18, buffer.len());

        buffer.seek(0).unwrap();

        let mut outstr1 = String::new();
        buffer.read_qname(&mut outstr1).unwrap();

        assert_eq!(instr1, outstr1);

        let mut outstr2 = String::new();
        buffer.read_qname(&mut outstr2).unwrap();

        assert_eq!(instr2, outstr2);

        // Make sure we're now at the end of the buffer
        assert_eq!(buffer.pos, buffer.buffer.len());
    }

    #[test]
    fn test_write_qname_compresses_shared_suffix() {
        let mut buffer = VectorPacketBuffer::new();

        buffer.write_qname("ns1.google.com", true, false).unwrap();
        buffer.write_qname("ns2.google.com", true, false).unwrap();

        // ns1.google.com takes 16 bytes, the second name is one label
        // followed by a pointer to "google.com" at offset 4
        assert_eq!(16 + 4 + 2, buffer.len());
        assert_eq!(&[0xC0, 0x04], buffer.get_range(20, 2).unwrap());

        buffer.seek(16).unwrap();
        let mut name = String::new();
        buffer.read_qname(&mut name).unwrap();
        assert_eq!("ns2.google.com", name);
    }

    #[test]
    fn test_compression_is_case_insensitive() {
        let mut buffer = VectorPacketBuffer::new();

        buffer.write_qname("Example.COM", true, false).unwrap();
        buffer.write_qname("www.example.com", true, false).unwrap();

        assert_eq!(13 + 4 + 2, buffer.len());
    }

    #[test]
    fn test_canonical_names_are_not_compressed() {
        let mut buffer = VectorPacketBuffer::new();

        buffer.write_qname("example.com", false, true).unwrap();
        buffer.write_qname("WWW.Example.com", false, true).unwrap();

        assert_eq!(13 + 17, buffer.len());
        assert_eq!(b"www", buffer.get_range(14, 3).unwrap());
    }

    #[test]
    fn test_self_referencing_pointer_is_rejected() {
        let data = [0x03, b'f', b'o', b'o', 0xC0, 0x04];
        let mut buffer = BytePacketBuffer::new(&data);

        let mut name = String::new();
        match buffer.read_qname(&mut name) {
            Err(BufferError::BadPointer { offset, target }) => {
                assert_eq!(4, offset);
                assert_eq!(4, target);
            }
            other => panic!("expected a bad pointer, got {:?}", other),
        }
    }

    #[test]
    fn test_forward_pointer_is_rejected() {
        let data = [0xC0, 0x02, 0x03, b'c', b'o', b'm', 0x00];
        let mut buffer = BytePacketBuffer::new(&data);

        let mut name = String::new();
        assert!(matches!(
            buffer.read_qname(&mut name),
            Err(BufferError::BadPointer { .. })
        ));
    }

    #[test]
    fn test_pointer_chain_to_earlier_offsets_is_followed() {
        // "com" at 0, "example" + ptr(0) at 5, "www" + ptr(5) at 15
        let data = [
            0x03, b'c', b'o', b'm', 0x00, 0x07, b'e', b'x', b'a', b'm', b'p', b'l', b'e', 0xC0,
            0x00, 0x03, b'w', b'w', b'w', 0xC0, 0x05,
        ];
        let mut buffer = BytePacketBuffer::new(&data);
        buffer.seek(15).unwrap();

        let mut name = String::new();
        buffer.read_qname(&mut name).unwrap();

        assert_eq!("www.example.com", name);
        assert_eq!(data.len(), buffer.pos());
    }

    #[test]
    fn test_reserved_label_type() {
        let data = [0x40, 0x00];
        let mut buffer = BytePacketBuffer::new(&data);

        let mut name = String::new();
        assert!(matches!(
            buffer.read_qname(&mut name),
            Err(BufferError::ReservedLabel { .. })
        ));
    }

    #[test]
    fn test_limit_stops_reads_but_not_pointers() {
        let data = [0x03, b'c', b'o', b'm', 0x00, 0xC0, 0x00, 0xAA];
        let mut buffer = BytePacketBuffer::new(&data);
        buffer.seek(5).unwrap();
        buffer.push_limit(7).unwrap();

        let mut name = String::new();
        buffer.read_qname(&mut name).unwrap();
        assert_eq!("com", name);

        assert!(matches!(
            buffer.read(),
            Err(BufferError::EndOfRecord { offset: 7 })
        ));

        buffer.pop_limit();
        assert_eq!(0xAA, buffer.read().unwrap());
    }

    #[test]
    fn test_long_labels_are_rejected() {
        let mut buffer = VectorPacketBuffer::new();
        let label = "a".repeat(64);

        assert!(matches!(
            buffer.write_qname(&format!("{}.com", label), true, false),
            Err(BufferError::LabelTooLong { .. })
        ));
    }

    #[test]
    fn test_binary_labels_survive_a_roundtrip() {
        // "a.b", then 0x00 0x5C 0x20, then "com"
        let data = [
            0x03, b'a', b'.', b'b', 0x03, 0x00, b'\\', b' ', 0x03, b'c', b'o', b'm', 0x00,
        ];
        let mut buffer = BytePacketBuffer::new(&data);

        let mut name = String::new();
        buffer.read_qname(&mut name).unwrap();
        assert_eq!("a\\.b.\\000\\\\\\032.com", name);

        let mut written = VectorPacketBuffer::new();
        written.write_qname(&name, true, false).unwrap();
        assert_eq!(&data[..], written.as_slice());
    }

    #[test]
    fn test_escaped_trailing_dot_is_part_of_the_label() {
        let mut buffer = VectorPacketBuffer::new();
        buffer.write_qname("odd\\..", false, false).unwrap();
        assert_eq!(&[0x04, b'o', b'd', b'd', b'.', 0x00], buffer.as_slice());
    }

    #[test]
    fn test_bad_escapes_are_rejected() {
        for name in ["bad\\25", "bad\\256.com", "bad\\"] {
            let mut buffer = VectorPacketBuffer::new();
            assert!(
                matches!(
                    buffer.write_qname(name, true, false),
                    Err(BufferError::BadEscape { .. })
                ),
                "{}",
                name
            );
        }
    }

    #[test]
    fn test_u48() {
        let mut buffer = VectorPacketBuffer::new();
        buffer.write_u48(0x0000_1234_5678_9ABC).unwrap();
        assert_eq!(6, buffer.len());

        buffer.seek(0).unwrap();
        assert_eq!(0x1234_5678_9ABC, buffer.read_u48().unwrap());
    }
}
