//! Header-level DNS helpers.
//!
//! The proxy relays messages untouched; it only looks inside them to read the
//! transaction ID, label log lines with the queried name, and build SERVFAIL
//! replies when an upstream cannot be reached.

pub const HEADER_LEN: usize = 12;

const FLAG_QR: u16 = 0x8000;
const OPCODE_MASK: u16 = 0x7800;
const FLAG_RD: u16 = 0x0100;
const FLAG_RA: u16 = 0x0080;
const RCODE_MASK: u16 = 0x000F;

/// RCODE 2.
pub const RCODE_SERVFAIL: u8 = 2;

/// Transaction ID of a message, `None` if shorter than a header.
pub fn message_id(msg: &[u8]) -> Option<u16> {
    if msg.len() < HEADER_LEN {
        return None;
    }
    Some(u16::from_be_bytes([msg[0], msg[1]]))
}

/// Response code of a message, `None` if shorter than a header.
pub fn response_code(msg: &[u8]) -> Option<u8> {
    if msg.len() < HEADER_LEN {
        return None;
    }
    Some((u16::from_be_bytes([msg[2], msg[3]]) & RCODE_MASK) as u8)
}

/// The first question of a query, for logging.
#[derive(Debug, Clone)]
pub struct DnsQuery {
    pub id: u16,
    pub domain: String,
    pub qtype: u16,
    pub qclass: u16,
}

impl DnsQuery {
    /// Parse the header and first question from raw bytes.
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < HEADER_LEN + 1 {
            return None;
        }

        let id = u16::from_be_bytes([data[0], data[1]]);

        let mut pos = HEADER_LEN;
        let mut labels = Vec::new();

        loop {
            let label_len = *data.get(pos)? as usize;
            pos += 1;
            if label_len == 0 {
                break;
            }
            // Questions never start with a compression pointer.
            if label_len & 0xC0 != 0 || pos + label_len > data.len() {
                return None;
            }
            labels.push(String::from_utf8_lossy(&data[pos..pos + label_len]).into_owned());
            pos += label_len;
        }

        if pos + 4 > data.len() {
            return None;
        }
        let qtype = u16::from_be_bytes([data[pos], data[pos + 1]]);
        let qclass = u16::from_be_bytes([data[pos + 2], data[pos + 3]]);

        let domain = if labels.is_empty() {
            ".".to_string()
        } else {
            labels.join(".").to_lowercase()
        };

        Some(Self {
            id,
            domain,
            qtype,
            qclass,
        })
    }
}

/// Domain of the first question, or `<unknown>`.
pub fn query_label(msg: &[u8]) -> String {
    DnsQuery::parse(msg)
        .map(|q| q.domain)
        .unwrap_or_else(|| "<unknown>".to_string())
}

/// Build a SERVFAIL reply to `query`.
///
/// Copies the ID, opcode and RD bit, sets QR and RA, and echoes the question
/// section when it parses cleanly. Returns `None` if `query` has no header.
pub fn servfail_response(query: &[u8]) -> Option<Vec<u8>> {
    let id = message_id(query)?;
    let flags = u16::from_be_bytes([query[2], query[3]]);
    let qdcount = u16::from_be_bytes([query[4], query[5]]);

    let question_end = skip_questions(query, qdcount);
    let (qdcount, question) = match question_end {
        Some(end) => (qdcount, &query[HEADER_LEN..end]),
        None => (0, &[][..]),
    };

    let flags = FLAG_QR | (flags & (OPCODE_MASK | FLAG_RD)) | FLAG_RA | RCODE_SERVFAIL as u16;

    let mut response = Vec::with_capacity(HEADER_LEN + question.len());
    response.extend_from_slice(&id.to_be_bytes());
    response.extend_from_slice(&flags.to_be_bytes());
    response.extend_from_slice(&qdcount.to_be_bytes());
    response.extend_from_slice(&[0x00, 0x00]); // ANCOUNT
    response.extend_from_slice(&[0x00, 0x00]); // NSCOUNT
    response.extend_from_slice(&[0x00, 0x00]); // ARCOUNT
    response.extend_from_slice(question);

    Some(response)
}

/// Offset just past `count` questions, `None` if they overrun the message.
fn skip_questions(data: &[u8], count: u16) -> Option<usize> {
    let mut pos = HEADER_LEN;
    for _ in 0..count {
        pos = skip_name(data, pos)?;
        pos += 4; // QTYPE + QCLASS
        if pos > data.len() {
            return None;
        }
    }
    Some(pos)
}

fn skip_name(data: &[u8], mut pos: usize) -> Option<usize> {
    loop {
        let b = *data.get(pos)?;
        match b {
            0 => return Some(pos + 1),
            b if b & 0xC0 == 0xC0 => {
                data.get(pos + 1)?;
                return Some(pos + 2);
            }
            b if b & 0xC0 != 0 => return None,
            len => pos += 1 + len as usize,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_query(id: u16, domain: &str) -> Vec<u8> {
        let mut packet = Vec::with_capacity(512);
        packet.extend_from_slice(&id.to_be_bytes());
        packet.extend_from_slice(&[0x01, 0x00]); // Flags: standard query, RD
        packet.extend_from_slice(&[0x00, 0x01]); // Questions: 1
        packet.extend_from_slice(&[0x00, 0x00]);
        packet.extend_from_slice(&[0x00, 0x00]);
        packet.extend_from_slice(&[0x00, 0x00]);
        for label in domain.split('.') {
            packet.push(label.len() as u8);
            packet.extend_from_slice(label.as_bytes());
        }
        packet.push(0x00);
        packet.extend_from_slice(&[0x00, 0x1c]); // Type: AAAA
        packet.extend_from_slice(&[0x00, 0x01]); // Class: IN
        packet
    }

    #[test]
    fn parse_reads_first_question() {
        let query = DnsQuery::parse(&build_query(0xbeef, "Example.COM")).unwrap();

        assert_eq!(query.id, 0xbeef);
        assert_eq!(query.domain, "example.com");
        assert_eq!(query.qtype, 28);
        assert_eq!(query.qclass, 1);
    }

    #[test]
    fn parse_rejects_truncated_question() {
        let mut query = build_query(1, "example.com");
        query.truncate(query.len() - 3);

        assert!(DnsQuery::parse(&query).is_none());
        assert_eq!(query_label(&query), "<unknown>");
    }

    #[test]
    fn message_id_needs_full_header() {
        assert_eq!(message_id(&[0x12, 0x34, 0, 0]), None);
        assert_eq!(message_id(&build_query(0x1234, "a.b")), Some(0x1234));
    }

    #[test]
    fn servfail_echoes_id_and_question() {
        let query = build_query(0x4242, "example.com");

        let response = servfail_response(&query).unwrap();

        assert_eq!(message_id(&response), Some(0x4242));
        assert_eq!(response_code(&response), Some(RCODE_SERVFAIL));
        // QR and RD, RA set.
        assert_eq!(response[2], 0x81);
        assert_eq!(response[3], 0x82);
        assert_eq!(&response[4..6], &[0x00, 0x01]);
        assert_eq!(&response[6..12], &[0; 6]);
        assert_eq!(&response[HEADER_LEN..], &query[HEADER_LEN..]);
    }

    #[test]
    fn servfail_drops_trailing_sections() {
        let mut query = build_query(7, "example.com");
        query[11] = 1; // ARCOUNT: EDNS OPT record
        let question_len = query.len();
        query.extend_from_slice(&[0x00, 0x00, 0x29, 0x10, 0x00, 0, 0, 0, 0, 0, 0]);

        let response = servfail_response(&query).unwrap();

        assert_eq!(response.len(), question_len);
        assert_eq!(response[11], 0);
    }

    #[test]
    fn servfail_without_parsable_question() {
        let mut query = build_query(9, "example.com");
        query.truncate(HEADER_LEN + 4);

        let response = servfail_response(&query).unwrap();

        assert_eq!(response.len(), HEADER_LEN);
        assert_eq!(&response[4..6], &[0x00, 0x00]);
        assert_eq!(message_id(&response), Some(9));
    }

    #[test]
    fn servfail_needs_header() {
        assert!(servfail_response(&[0u8; 5]).is_none());
    }
}
