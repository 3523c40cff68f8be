use std::io::{self, Read, Result, Write};

/// Reads the two byte length prefix of a DNS message sent over TCP
pub fn read_packet_length<R: Read>(stream: &mut R) -> Result<u16> {
    let mut len_buffer = [0; 2];
    stream.read_exact(&mut len_buffer)?;
    Ok(((len_buffer[0] as u16) << 8) | (len_buffer[1] as u16))
}

pub fn write_packet_length<W: Write>(stream: &mut W, len: usize) -> Result<()> {
    if len > u16::MAX as usize {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("message of {} bytes cannot be framed for TCP", len),
        ));
    }

    let mut len_buffer = [0; 2];
    len_buffer[0] = (len >> 8) as u8;
    len_buffer[1] = (len & 0xFF) as u8;
    stream.write_all(&len_buffer)?;
    Ok(())
}

/// Length-prefixes a message for TCP
pub fn frame_message(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut frame = Vec::with_capacity(bytes.len() + 2);
    write_packet_length(&mut frame, bytes.len())?;
    frame.extend_from_slice(bytes);
    Ok(frame)
}

/// Removes every complete length-prefixed message from the front of
/// `incoming`, leaving a trailing partial message in place
pub fn split_frames(incoming: &mut Vec<u8>) -> Vec<Vec<u8>> {
    let mut frames = Vec::new();
    let mut consumed = 0;

    loop {
        let mut rest = &incoming[consumed..];
        if rest.len() < 2 {
            break;
        }
        let len = match read_packet_length(&mut rest) {
            Ok(len) => len as usize,
            Err(_) => break,
        };
        if rest.len() < len {
            break;
        }
        frames.push(rest[..len].to_vec());
        consumed += 2 + len;
    }

    incoming.drain(..consumed);
    frames
}

/// Errors caused by running out of sockets or buffers rather than by the
/// remote end. These say nothing about the nameserver.
pub fn is_resource_exhaustion(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::EMFILE) | Some(libc::ENFILE) | Some(libc::ENOBUFS) | Some(libc::ENOMEM)
    ) || err.kind() == io::ErrorKind::OutOfMemory
}
