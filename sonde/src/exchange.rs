//! Driving built queries through a transport and collecting the replies.

use std::time::{Duration, Instant};

use toluol_proto::{Message, Record, RecordType};

use crate::config::Options;
use crate::deadline::Deadline;
use crate::error::{Error, Result};
use crate::query::{build_queries, Query};
use crate::target::Target;
use crate::transport::{Reply, Transport};

/// Everything exchanged with one server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry {
    pub server: String,
    pub queries: Vec<Query>,
    pub replies: Vec<Reply>,
    /// Wall-clock time for all queries, including connection setup.
    pub elapsed: Duration,
}

/// Joins the character strings of every TXT answer into one.
pub fn concat_txt(message: &mut Message) {
    for record in message.answers.iter_mut() {
        if let Some(txt) = record.rdata_mut().as_mut_txt() {
            let joined = txt.text.concat();
            txt.text = vec![joined];
        }
    }
}

/// Rounds every answer TTL down to a whole minute.
pub fn round_ttls(message: &mut Message) {
    for record in message.answers.iter_mut() {
        if let Record::NONOPT(record) = record {
            record.ttl -= record.ttl % 60;
        }
    }
}

/// Exchanges `queries` in order over `transport`, applying the id check and post-processing
/// configured in `opts`. The first failure aborts the whole batch.
pub fn exchange_queries(
    transport: &mut Transport,
    queries: &[Query],
    opts: &Options,
    deadline: Deadline,
) -> Result<Vec<Reply>> {
    let mut replies = Vec::with_capacity(queries.len());
    for query in queries {
        tracing::debug!(
            "querying {} {} (id {})",
            query.question.qname,
            query.question.qtype,
            query.id
        );
        let mut reply = transport.exchange(query, deadline)?;

        if opts.id_check && transport.checks_id() && reply.message.header.msg_id != query.id {
            return Err(Error::IdMismatch {
                sent: query.id,
                received: reply.message.header.msg_id,
            });
        }
        if opts.txt_concat {
            concat_txt(&mut reply.message);
        }
        if opts.round_ttl {
            round_ttls(&mut reply.message);
        }
        replies.push(reply);
    }
    Ok(replies)
}

/// Queries `name` for every type in `types` against each server in turn.
///
/// Every server gets its own transport; all of them share one deadline of `opts.timeout`. The
/// returned entries are in server order, with replies in type order.
pub fn run<S: AsRef<str>>(
    servers: &[S],
    name: &str,
    types: &[RecordType],
    opts: &Options,
) -> Result<Vec<Entry>> {
    // all configuration errors surface before the first packet is sent
    let targets = servers
        .iter()
        .map(|s| Target::resolve(s.as_ref(), opts))
        .collect::<Result<Vec<_>>>()?;
    let queries = build_queries(name, types, opts)?;

    let deadline = Deadline::after(opts.timeout);
    let mut entries = Vec::with_capacity(targets.len());
    for target in targets {
        let mut transport = Transport::new(&target, opts)?;

        let start = Instant::now();
        let result = exchange_queries(&mut transport, &queries, opts, deadline);
        let elapsed = start.elapsed();
        if let Err(e) = transport.close() {
            tracing::debug!("closing transport to {}: {}", target, e);
        }

        entries.push(Entry {
            server: target.to_string(),
            queries: queries.clone(),
            replies: result?,
            elapsed,
        });
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::net::UdpSocket;
    use std::thread;

    use super::*;

    /// Builds a reply to `query` with the given answer records appended.
    fn reply_to(query: &[u8], id: u16, answers: &[&[u8]]) -> Vec<u8> {
        let mut reply = query.to_vec();
        reply[..2].copy_from_slice(&id.to_be_bytes());
        reply[2] = 0x81;
        reply[3] = 0x80;
        reply[7] = answers.len() as u8;
        for answer in answers {
            reply.extend_from_slice(answer);
        }
        reply
    }

    const TXT_ANSWER: &[u8] = &[
        0xc0, 12, 0, 16, 0, 1, 0, 0, 0x0e, 0x3b, 0, 6, 2, b'a', b'b', 2, b'c', b'd',
    ];

    /// Answers `count` queries, echoing the id if `honest`.
    fn serve(count: usize, honest: bool) -> String {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let addr = socket.local_addr().unwrap().to_string();
        thread::spawn(move || {
            let mut buf = [0u8; 512];
            for _ in 0..count {
                let (len, peer) = socket.recv_from(&mut buf).unwrap();
                let query = &buf[..len];
                let id = u16::from_be_bytes([query[0], query[1]]);
                let id = if honest { id } else { id.wrapping_add(1) };
                socket.send_to(&reply_to(query, id, &[TXT_ANSWER]), peer).unwrap();
            }
        });
        addr
    }

    #[test]
    fn post_processing() {
        let mut message = Message::parse(&mut Cursor::new(
            &reply_to(
                &Query::new(
                    crate::query::parse_name("example.com").unwrap(),
                    RecordType::TXT,
                    toluol_proto::Class::IN,
                )
                .to_wire()
                .unwrap(),
                1,
                &[TXT_ANSWER],
            )[..],
        ))
        .unwrap();

        concat_txt(&mut message);
        let txt = message.answers[0].rdata().as_txt().unwrap();
        assert_eq!(txt.text, vec!["abcd".to_string()]);

        round_ttls(&mut message);
        // 0x0e3b = 3643
        assert_eq!(message.answers[0].as_nonopt().unwrap().ttl, 3600);
    }

    #[test]
    fn multiple_servers_in_order() {
        let first = serve(2, true);
        let second = serve(2, true);
        let opts = Options {
            txt_concat: true,
            ..Options::default()
        };
        let entries = run(
            &[first.as_str(), second.as_str()],
            "example.com",
            &[RecordType::TXT, RecordType::A],
            &opts,
        )
        .unwrap();

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].server, format!("plain://{}", first));
        assert_eq!(entries[1].server, format!("plain://{}", second));
        for entry in &entries {
            assert_eq!(entry.replies.len(), 2);
            for (query, reply) in entry.queries.iter().zip(&entry.replies) {
                assert_eq!(reply.message.header.msg_id, query.id);
                assert_eq!(reply.message.questions[0], query.question);
            }
            let txt = entry.replies[0].message.answers[0].rdata().as_txt().unwrap();
            assert_eq!(txt.text, vec!["abcd".to_string()]);
        }
    }

    #[test]
    fn servers_share_one_deadline() {
        let slow = || {
            let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
            let addr = socket.local_addr().unwrap().to_string();
            thread::spawn(move || {
                let mut buf = [0u8; 512];
                let (len, peer) = socket.recv_from(&mut buf).unwrap();
                thread::sleep(Duration::from_millis(700));
                let id = u16::from_be_bytes([buf[0], buf[1]]);
                let _ = socket.send_to(&reply_to(&buf[..len], id, &[TXT_ANSWER]), peer);
            });
            addr
        };
        let (first, second) = (slow(), slow());
        let opts = Options {
            timeout: Duration::from_millis(1000),
            ..Options::default()
        };

        // either server alone fits the timeout, both together do not
        let start = Instant::now();
        let result = run(&[first.as_str(), second.as_str()], "example.com", &[RecordType::TXT], &opts);
        assert!(matches!(result, Err(Error::Timeout(_))), "{:?}", result);
        assert!(start.elapsed() < Duration::from_millis(1400));
    }

    #[test]
    fn id_mismatch() {
        let server = serve(1, false);
        let result = run(&[server.as_str()], "example.com", &[RecordType::A], &Options::default());
        assert!(matches!(result, Err(Error::IdMismatch { .. })));

        let server = serve(1, false);
        let opts = Options {
            id_check: false,
            ..Options::default()
        };
        assert!(run(&[server.as_str()], "example.com", &[RecordType::A], &opts).is_ok());
    }

    #[test]
    fn configuration_errors_come_first() {
        // the second specifier is bad, so the first server must never be contacted
        let result = run(
            &["127.0.0.1:9", "ftp://nope"],
            "example.com",
            &[RecordType::A],
            &Options::default(),
        );
        assert!(matches!(result, Err(Error::InvalidSpecifier { .. })));
    }
}
