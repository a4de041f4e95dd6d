//! The query front end of the listener threads.
//!
//! The front end parses just enough of a query to find its question,
//! looks up the zone inside a reader critical section, and assembles the
//! response from the answer provided by the zone’s content.

use std::cell::RefCell;
use std::io;
use std::net::{TcpListener as StdTcpListener, UdpSocket};
use std::rc::Rc;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::LocalSet;
use tracing::{debug, trace, warn};

use crate::base::iana::{
    CLASS_CH, CLASS_IN, RTYPE_ANY, RTYPE_AXFR, RTYPE_TXT,
};
use crate::base::{Name, Rcode};
use crate::config::{Config, DEFAULT_CHAOS_RESPONSE};
use crate::stats::WorkerStats;
use crate::zonetree::{Answer, ZoneReader};

/// The length of the message header.
const HEADER_LEN: usize = 12;

const FLAG_QR: u16 = 0x8000;
const FLAG_AA: u16 = 0x0400;
const FLAG_TC: u16 = 0x0200;
const FLAG_RD: u16 = 0x0100;

/// The largest response sent over UDP.
pub const UDP_MAX_RESPONSE: usize = 512;

/// The largest response sent over TCP.
pub const TCP_MAX_RESPONSE: usize = 65535;

/// The receive buffer size for UDP queries.
const UDP_RECV_BUF: usize = 4096;

//------------ Global setup --------------------------------------------------

/// The answer record for CHAOS class queries.
static CHAOS: OnceLock<Vec<u8>> = OnceLock::new();

/// Prepares the process-wide data used while answering queries.
///
/// Has to happen before the listener threads start. Only the first call
/// has an effect.
pub fn global_setup(config: &Config) {
    if CHAOS.set(chaos_record(&config.chaos_response)).is_ok() {
        debug!("CHAOS queries answered with \"{}\"", config.chaos_response);
    }
}

fn chaos() -> &'static [u8] {
    CHAOS.get_or_init(|| chaos_record(DEFAULT_CHAOS_RESPONSE))
}

/// Builds a TXT record owned by the question name.
///
/// Text longer than a single character string is cut short.
fn chaos_record(text: &str) -> Vec<u8> {
    let text = &text.as_bytes()[..text.len().min(255)];
    let mut res = vec![0xC0, 12];
    res.extend_from_slice(&RTYPE_TXT.to_be_bytes());
    res.extend_from_slice(&CLASS_CH.to_be_bytes());
    res.extend_from_slice(&0u32.to_be_bytes());
    res.extend_from_slice(&(text.len() as u16 + 1).to_be_bytes());
    res.push(text.len() as u8);
    res.extend_from_slice(text);
    res
}

//------------ Query processing ----------------------------------------------

/// Produces the response to a query.
///
/// Returns `None` if the message doesn’t warrant a response at all.
pub fn answer_query(
    reader: &mut ZoneReader,
    query: &[u8],
    max_len: usize,
) -> Option<(Vec<u8>, Rcode)> {
    if query.len() < HEADER_LEN {
        return None;
    }
    let flags = u16::from_be_bytes([query[2], query[3]]);
    if flags & FLAG_QR != 0 {
        return None;
    }
    let response = Response::new(query, flags);

    if (flags >> 11) & 0x0F != 0 {
        return Some(response.finish(Rcode::NotImp, max_len));
    }
    if u16::from_be_bytes([query[4], query[5]]) != 1 {
        return Some(response.finish(Rcode::FormErr, max_len));
    }
    let Ok((qname, qname_len)) = Name::from_wire(&query[HEADER_LEN..]) else {
        return Some(response.finish(Rcode::FormErr, max_len));
    };
    let question_end = HEADER_LEN + qname_len + 4;
    let Some(question) = query.get(HEADER_LEN..question_end) else {
        return Some(response.finish(Rcode::FormErr, max_len));
    };
    let field = |pos: usize| {
        let pos = qname_len + pos;
        u16::from_be_bytes([question[pos], question[pos + 1]])
    };
    let (qtype, qclass) = (field(0), field(2));
    let mut response = response.with_question(question);

    if qclass == CLASS_CH && (qtype == RTYPE_TXT || qtype == RTYPE_ANY) {
        let mut answer = Answer::new(Rcode::NoError);
        answer.push_answer(chaos());
        response.authoritative(answer);
        return Some(response.finish(Rcode::NoError, max_len));
    }
    if qclass != CLASS_IN {
        return Some(response.finish(Rcode::Refused, max_len));
    }
    if qtype == RTYPE_AXFR {
        return Some(response.finish(Rcode::NotImp, max_len));
    }

    let guard = reader.enter();
    let Some((zone, auth_depth)) = guard.find_zone_for(&qname) else {
        trace!("No zone for {qname}");
        return Some(response.finish(Rcode::Refused, max_len));
    };
    let answer = zone.content().answer(&qname, qtype, auth_depth);
    drop(guard);
    response.authoritative(answer);
    let rcode = response.rcode();
    Some(response.finish(rcode, max_len))
}

/// A response under construction.
struct Response<'a> {
    header: [u8; HEADER_LEN],
    question: &'a [u8],
    answer: Option<Answer>,
}

impl<'a> Response<'a> {
    fn new(query: &[u8], flags: u16) -> Self {
        let mut header = [0u8; HEADER_LEN];
        header[..2].copy_from_slice(&query[..2]);
        // Keep opcode and RD, set QR.
        let flags = FLAG_QR | (flags & (0x7800 | FLAG_RD));
        header[2..4].copy_from_slice(&flags.to_be_bytes());
        Response {
            header,
            question: &[],
            answer: None,
        }
    }

    fn with_question(mut self, question: &'a [u8]) -> Self {
        self.question = question;
        self
    }

    fn authoritative(&mut self, answer: Answer) {
        self.set_flag(FLAG_AA);
        self.answer = Some(answer);
    }

    fn rcode(&self) -> Rcode {
        self.answer
            .as_ref()
            .map(Answer::rcode)
            .unwrap_or(Rcode::NoError)
    }

    fn set_flag(&mut self, flag: u16) {
        let flags = u16::from_be_bytes([self.header[2], self.header[3]]);
        self.header[2..4].copy_from_slice(&(flags | flag).to_be_bytes());
    }

    fn finish(mut self, rcode: Rcode, max_len: usize) -> (Vec<u8>, Rcode) {
        self.header[3] = (self.header[3] & 0xF0) | rcode.to_int();
        let qdcount = u16::from(!self.question.is_empty());
        self.header[4..6].copy_from_slice(&qdcount.to_be_bytes());

        let mut res = Vec::with_capacity(512);
        res.extend_from_slice(&self.header);
        res.extend_from_slice(self.question);
        if let Some(answer) = self.answer.take() {
            let len = res.len()
                + answer.answer_section().len()
                + answer.authority_section().len();
            if len > max_len {
                res[2] |= (FLAG_TC >> 8) as u8;
            } else {
                res[6..8].copy_from_slice(&answer.ancount().to_be_bytes());
                res[8..10].copy_from_slice(&answer.nscount().to_be_bytes());
                res.extend_from_slice(answer.answer_section());
                res.extend_from_slice(answer.authority_section());
            }
        }
        (res, rcode)
    }
}

//------------ UDP -----------------------------------------------------------

/// Serves queries on a UDP socket forever.
pub fn run_udp(
    socket: UdpSocket,
    mut reader: ZoneReader,
    stats: Arc<WorkerStats>,
) -> io::Result<()> {
    let mut buf = vec![0u8; UDP_RECV_BUF];
    loop {
        let (len, peer) = match socket.recv_from(&mut buf) {
            Ok(res) => res,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                warn!("UDP receive on {} failed: {err}", stats.addr());
                continue;
            }
        };
        match answer_query(&mut reader, &buf[..len], UDP_MAX_RESPONSE) {
            Some((response, rcode)) => {
                stats.record(rcode);
                if let Err(err) = socket.send_to(&response, peer) {
                    debug!("UDP send to {peer} failed: {err}");
                }
            }
            None => stats.record_dropped(),
        }
    }
}

//------------ TCP -----------------------------------------------------------

/// Accepts and serves TCP connections forever.
///
/// Runs a single-threaded runtime on the calling thread.
pub fn run_tcp(
    listener: StdTcpListener,
    reader: ZoneReader,
    stats: Arc<WorkerStats>,
    idle_timeout: Duration,
) -> io::Result<()> {
    listener.set_nonblocking(true)?;
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_io()
        .enable_time()
        .build()?;
    LocalSet::new().block_on(
        &runtime,
        accept_connections(listener, reader, stats, idle_timeout),
    )
}

async fn accept_connections(
    listener: StdTcpListener,
    reader: ZoneReader,
    stats: Arc<WorkerStats>,
    idle_timeout: Duration,
) -> io::Result<()> {
    let listener = TcpListener::from_std(listener)?;
    let reader = Rc::new(RefCell::new(reader));
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(res) => res,
            Err(err) => {
                warn!("TCP accept on {} failed: {err}", stats.addr());
                tokio::time::sleep(Duration::from_millis(10)).await;
                continue;
            }
        };
        trace!("TCP connection from {peer}");
        stats.record_connection();
        tokio::task::spawn_local(serve_connection(
            stream,
            reader.clone(),
            stats.clone(),
            idle_timeout,
        ));
    }
}

/// Serves length-prefixed queries on a stream until it is closed or idle.
pub async fn serve_connection(
    mut stream: impl AsyncRead + AsyncWrite + Unpin,
    reader: Rc<RefCell<ZoneReader>>,
    stats: Arc<WorkerStats>,
    idle_timeout: Duration,
) {
    let mut buf = Vec::new();
    loop {
        let len = match tokio::time::timeout(idle_timeout, stream.read_u16())
            .await
        {
            Ok(Ok(len)) => usize::from(len),
            Ok(Err(_)) => break,
            Err(_) => {
                trace!("Closing idle TCP connection");
                break;
            }
        };
        buf.resize(len, 0);
        match tokio::time::timeout(idle_timeout, stream.read_exact(&mut buf))
            .await
        {
            Ok(Ok(_)) => {}
            _ => break,
        }

        let res =
            answer_query(&mut reader.borrow_mut(), &buf, TCP_MAX_RESPONSE);
        let Some((response, rcode)) = res else {
            stats.record_dropped();
            break;
        };
        stats.record(rcode);
        // TCP_MAX_RESPONSE bounds the length.
        let len = response.len() as u16;
        let mut out = Vec::with_capacity(response.len() + 2);
        out.extend_from_slice(&len.to_be_bytes());
        out.extend_from_slice(&response);
        if stream.write_all(&out).await.is_err() {
            break;
        }
    }
    let _ = stream.shutdown().await;
}

//============ Testing =======================================================
