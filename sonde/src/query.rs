//! Building query messages.

use std::str::FromStr;

use byteorder::{NetworkEndian, WriteBytesExt};
use rand::Rng;
use toluol_proto::{Class, Name, Question, RecordType};

use crate::config::{Options, QueryFlags};
use crate::edns::Edns;
use crate::error::{Error, Result};

/// Length of a DNS message header.
pub const HEADER_LEN: usize = 12;

/// One query message, ready to be encoded and sent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Query {
    pub id: u16,
    pub flags: QueryFlags,
    pub question: Question,
    pub edns: Option<Edns>,
}

impl Query {
    /// Creates a query with a random id, default flags and no `OPT` record.
    pub fn new(name: Name, qtype: RecordType, class: Class) -> Self {
        Query {
            id: rand::thread_rng().gen(),
            flags: QueryFlags::default(),
            question: Question::new(name, qtype, class),
            edns: None,
        }
    }

    /// Encodes the query in wire format.
    pub fn to_wire(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(512);
        buf.write_u16::<NetworkEndian>(self.id).map_err(io_encode)?;
        buf.write_u16::<NetworkEndian>(self.flags.as_bits()).map_err(io_encode)?;
        // qdcount, ancount, nscount, arcount
        buf.write_u16::<NetworkEndian>(1).map_err(io_encode)?;
        buf.write_u16::<NetworkEndian>(0).map_err(io_encode)?;
        buf.write_u16::<NetworkEndian>(0).map_err(io_encode)?;
        buf.write_u16::<NetworkEndian>(self.edns.is_some() as u16).map_err(io_encode)?;
        self.question.encode_into(&mut buf)?;
        if let Some(edns) = &self.edns {
            edns.encode_into(&mut buf)?;
        }
        Ok(buf)
    }

    /// Whether the query carries the EDNS0 TCP keepalive option.
    pub fn has_keepalive(&self) -> bool {
        self.edns.as_ref().map_or(false, Edns::has_keepalive)
    }
}

fn io_encode(e: std::io::Error) -> Error {
    Error::Encode(e.into())
}

/// Parses a record type mnemonic (`AAAA`, `txt`), a `TYPEnnn` form or a bare type number.
///
/// # Examples
/// ```rust
/// use sonde::query::parse_type;
/// use toluol_proto::RecordType;
///
/// assert_eq!(parse_type("aaaa").unwrap(), RecordType::AAAA);
/// assert_eq!(parse_type("TYPE65").unwrap(), RecordType::Unknown(65));
/// assert_eq!(parse_type("AXFR").unwrap(), RecordType::Unknown(252));
/// assert!(parse_type("bogus").is_err());
/// ```
pub fn parse_type(s: &str) -> Result<RecordType> {
    let upper = s.to_ascii_uppercase();
    let meta = match upper.as_str() {
        "SVCB" => Some(64),
        "HTTPS" => Some(65),
        "IXFR" => Some(251),
        "AXFR" => Some(252),
        "ANY" => Some(255),
        _ => None,
    };
    if let Some(code) = meta {
        return Ok(RecordType::from(code));
    }

    let numeric = upper.strip_prefix("TYPE").unwrap_or(&upper);
    if let Ok(code) = numeric.parse::<u16>() {
        return Ok(RecordType::from(code));
    }

    match RecordType::from_str(&upper) {
        Ok(RecordType::Unknown(_)) | Err(_) => Err(Error::InvalidType(s.to_string())),
        Ok(rtype) => Ok(rtype),
    }
}

/// Parses and fully qualifies a query name.
pub fn parse_name(name: &str) -> Result<Name> {
    Name::from_ascii(name)
        .map_err(|e| Error::config(format!("invalid query name {:?}: {}", name, e)))
}

/// Builds one query per record type, in the given order.
///
/// Each query gets its own random id unless `opts.id` pins one.
///
/// # Examples
/// ```rust
/// use sonde::query::build_queries;
/// use sonde::Options;
/// use toluol_proto::RecordType;
///
/// let opts = Options { id: Some(4242), ..Options::default() };
/// let queries = build_queries("example.com", &[RecordType::A, RecordType::MX], &opts).unwrap();
/// assert_eq!(queries.len(), 2);
/// assert!(queries.iter().all(|q| q.id == 4242));
/// assert_eq!(queries[1].question.qtype, RecordType::MX);
/// ```
pub fn build_queries(name: &str, types: &[RecordType], opts: &Options) -> Result<Vec<Query>> {
    let name = parse_name(name)?;
    let mut rng = rand::thread_rng();

    let mut queries = Vec::with_capacity(types.len());
    for qtype in types {
        let question = Question::new(name.clone(), *qtype, opts.class);
        let msg_len = HEADER_LEN + question.encode()?.len();
        let query = Query {
            id: opts.id.unwrap_or_else(|| rng.gen()),
            flags: opts.flags,
            question,
            edns: Edns::from_options(opts, msg_len)?,
        };
        tracing::trace!(id = query.id, qtype = %qtype, "built query");
        queries.push(query);
    }

    Ok(queries)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use toluol_proto::{Message, Record};

    use super::*;
    use crate::edns::{padding_len, EdnsOption};

    #[test]
    fn wire_format() {
        let opts = Options {
            id: Some(0xbeef),
            flags: QueryFlags {
                ad: true,
                ..QueryFlags::default()
            },
            ..Options::default()
        };
        let query = &build_queries("example.com.", &[RecordType::A], &opts).unwrap()[0];
        let wire = query.to_wire().unwrap();

        assert_eq!(&wire[..12], &[0xbe, 0xef, 0x01, 0x20, 0, 1, 0, 0, 0, 0, 0, 0]);
        assert_eq!(wire.len(), 12 + 13 + 4);

        let msg = Message::parse(&mut Cursor::new(&wire[..])).unwrap();
        assert_eq!(msg.header.msg_id, 0xbeef);
        assert!(msg.header.flags.rd);
        assert_eq!(msg.questions, vec![query.question.clone()]);
    }

    #[test]
    fn opt_record_only_when_requested() {
        let opts = Options::default();
        let plain = &build_queries("example.com", &[RecordType::A], &opts).unwrap()[0];
        assert!(plain.edns.is_none());

        let opts = Options {
            dnssec: true,
            nsid: true,
            udp_buffer: 4096,
            ..Options::default()
        };
        let query = &build_queries("example.com", &[RecordType::DNSKEY], &opts).unwrap()[0];
        let edns = query.edns.as_ref().unwrap();
        assert!(edns.dnssec_ok);
        assert_eq!(edns.udp_size, 4096);
        assert_eq!(edns.options, vec![EdnsOption::Nsid]);

        let wire = query.to_wire().unwrap();
        let msg = Message::parse(&mut Cursor::new(&wire[..])).unwrap();
        match &msg.additional_answers[..] {
            [Record::OPT(opt)] => assert_eq!(opt.payload_size, 4096),
            other => panic!("unexpected additional section {:?}", other),
        }
    }

    #[test]
    fn padding_uses_unpadded_length() {
        let opts = Options {
            pad: true,
            ..Options::default()
        };
        let query = &build_queries("example.com", &[RecordType::A], &opts).unwrap()[0];
        let edns = query.edns.as_ref().unwrap();
        assert_eq!(edns.options, vec![EdnsOption::Padding(padding_len(29, 1232))]);
    }

    #[test]
    fn independent_ids() {
        let types = vec![RecordType::A; 32];
        let queries = build_queries("example.com", &types, &Options::default()).unwrap();
        let first = queries[0].id;
        // 32 identical random ids are practically impossible
        assert!(queries.iter().any(|q| q.id != first));
    }

    #[test]
    fn invalid_input() {
        assert!(matches!(
            build_queries("exa mple.com", &[RecordType::A], &Options::default()),
            Err(Error::Config(_))
        ));
        let opts = Options {
            client_subnet: Some("300.1.1.1/8".into()),
            ..Options::default()
        };
        assert!(matches!(
            build_queries("example.com", &[RecordType::A], &opts),
            Err(Error::Config(_))
        ));
        assert!(matches!(parse_type("Unknown"), Err(Error::InvalidType(_))));
        assert_eq!(parse_type("15").unwrap(), RecordType::MX);
    }
}
