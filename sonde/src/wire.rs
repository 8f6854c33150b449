//! Raw access to wire-format messages, for the few places where a fully decoded
//! [`Message`](toluol_proto::Message) is not available or not suitable.

use std::io::{Cursor, Read};

use byteorder::{NetworkEndian, ReadBytesExt};

use crate::error::{Error, Result};

const TYPE_TXT: u16 = 16;

/// Returns the transaction id of an encoded message.
pub fn message_id(msg: &[u8]) -> Option<u16> {
    (msg.len() >= 2).then(|| u16::from_be_bytes([msg[0], msg[1]]))
}

/// Overwrites the transaction id of an encoded message.
pub fn set_message_id(msg: &mut [u8], id: u16) {
    if msg.len() >= 2 {
        msg[..2].copy_from_slice(&id.to_be_bytes());
    }
}

/// Whether the TC bit of an encoded message is set.
pub fn is_truncated(msg: &[u8]) -> bool {
    msg.len() >= 3 && msg[2] & 0x02 != 0
}

fn skip_name(cur: &mut Cursor<&[u8]>) -> Result<()> {
    loop {
        let len = cur.read_u8().map_err(malformed)?;
        match len {
            0 => return Ok(()),
            l if l & 0xc0 == 0xc0 => {
                cur.read_u8().map_err(malformed)?;
                return Ok(());
            }
            l => cur.set_position(cur.position() + l as u64),
        }
    }
}

fn malformed(_: std::io::Error) -> Error {
    Error::protocol("malformed DNS message")
}

/// Extracts the raw data of every TXT record in the answer section, with the character strings
/// of each record joined together.
///
/// Unlike the decoded form, this keeps binary TXT data intact.
pub fn answer_txt(msg: &[u8]) -> Result<Vec<Vec<u8>>> {
    let mut cur = Cursor::new(msg);
    cur.set_position(4);
    let qdcount = cur.read_u16::<NetworkEndian>().map_err(malformed)?;
    let ancount = cur.read_u16::<NetworkEndian>().map_err(malformed)?;
    cur.set_position(12);

    for _ in 0..qdcount {
        skip_name(&mut cur)?;
        cur.set_position(cur.position() + 4);
    }

    let mut records = Vec::new();
    for _ in 0..ancount {
        skip_name(&mut cur)?;
        let rtype = cur.read_u16::<NetworkEndian>().map_err(malformed)?;
        // class and ttl
        cur.set_position(cur.position() + 6);
        let rdlength = cur.read_u16::<NetworkEndian>().map_err(malformed)? as usize;
        let mut rdata = vec![0; rdlength];
        cur.read_exact(&mut rdata).map_err(malformed)?;

        if rtype != TYPE_TXT {
            continue;
        }
        let mut joined = Vec::with_capacity(rdlength);
        let mut pos = 0;
        while pos < rdata.len() {
            let len = rdata[pos] as usize;
            let end = pos + 1 + len;
            if end > rdata.len() {
                return Err(Error::protocol("TXT character string exceeds record"));
            }
            joined.extend_from_slice(&rdata[pos + 1..end]);
            pos = end;
        }
        records.push(joined);
    }

    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn txt_response() -> Vec<u8> {
        let mut msg = vec![0x12, 0x34, 0x81, 0x80, 0, 1, 0, 2, 0, 0, 0, 0];
        // question: a.example TXT IN
        msg.extend_from_slice(&[1, b'a', 7]);
        msg.extend_from_slice(b"example");
        msg.extend_from_slice(&[0, 0, 16, 0, 1]);
        // answer 1: compressed owner, TXT with two strings, one of them binary
        msg.extend_from_slice(&[0xc0, 12, 0, 16, 0, 1, 0, 0, 0, 60, 0, 6]);
        msg.extend_from_slice(&[2, 0xff, 0x00, 2, b'h', b'i']);
        // answer 2: an A record that must be skipped
        msg.extend_from_slice(&[0xc0, 12, 0, 1, 0, 1, 0, 0, 0, 60, 0, 4, 192, 0, 2, 1]);
        msg
    }

    #[test]
    fn header_access() {
        let mut msg = txt_response();
        assert_eq!(message_id(&msg), Some(0x1234));
        assert!(!is_truncated(&msg));
        set_message_id(&mut msg, 0);
        assert_eq!(message_id(&msg), Some(0));
        msg[2] |= 0x02;
        assert!(is_truncated(&msg));
        assert_eq!(message_id(&[1]), None);
    }

    #[test]
    fn binary_txt() {
        let records = answer_txt(&txt_response()).unwrap();
        assert_eq!(records, vec![vec![0xff, 0x00, b'h', b'i']]);

        let mut broken = txt_response();
        broken.truncate(40);
        assert!(answer_txt(&broken).is_err());
    }
}
