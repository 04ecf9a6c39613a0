//! Loopback MQTT v5 broker for transport tests
//!
//! Speaks just enough of the protocol to accept CONNECT, SUBSCRIBE, QoS 0/1
//! PUBLISH, PINGREQ and DISCONNECT, and records what every connection sent
//! in arrival order. Nothing is routed between clients.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};
use tracing::debug;

const CONNECT: u8 = 1;
const PUBLISH: u8 = 3;
const SUBSCRIBE: u8 = 8;
const PINGREQ: u8 = 12;
const DISCONNECT: u8 = 14;

/// Success CONNACK: no session present, reason 0, no properties
const CONNACK: [u8; 5] = [0x20, 3, 0, 0, 0];
const PINGRESP: [u8; 2] = [0xD0, 0];

#[derive(Debug, Clone, Default)]
pub struct FakeBrokerOptions {
    /// Delay between reading CONNECT and answering CONNACK
    pub connack_delay: Duration,
    /// Close the first connection after it has sent this many
    /// SUBSCRIBE/PUBLISH packets, without acknowledging the last one
    pub drop_first_after: Option<usize>,
}

/// A client packet the broker recorded
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerPacket {
    Subscribe {
        filter: String,
    },
    Publish {
        topic: String,
        payload: Vec<u8>,
        retain: bool,
    },
    Disconnect,
}

impl BrokerPacket {
    pub fn subscribe(filter: &str) -> Self {
        Self::Subscribe {
            filter: filter.to_string(),
        }
    }

    pub fn publish(topic: &str, payload: &[u8], retain: bool) -> Self {
        Self::Publish {
            topic: topic.to_string(),
            payload: payload.to_vec(),
            retain,
        }
    }
}

type Recorded = Arc<Mutex<Vec<(usize, BrokerPacket)>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Broker listening on an ephemeral loopback port until dropped
pub struct FakeBroker {
    addr: SocketAddr,
    connections: Arc<AtomicUsize>,
    packets: Recorded,
    accept_task: JoinHandle<()>,
}

impl Drop for FakeBroker {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

impl FakeBroker {
    pub async fn start(options: FakeBrokerOptions) -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let connections = Arc::new(AtomicUsize::new(0));
        let packets: Recorded = Arc::default();

        let accept_task = tokio::spawn(accept_loop(
            listener,
            options,
            connections.clone(),
            packets.clone(),
        ));

        Ok(Self {
            addr,
            connections,
            packets,
            accept_task,
        })
    }

    pub fn url(&self) -> String {
        format!("mqtt://{}", self.addr)
    }

    /// TCP connections accepted so far
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Recorded packets tagged with the 0-based connection index
    pub fn packets(&self) -> Vec<(usize, BrokerPacket)> {
        lock(&self.packets).clone()
    }

    /// Wait until at least `count` packets are recorded or `timeout` passes,
    /// then return whatever has been recorded
    pub async fn wait_for_packets(&self, count: usize, timeout: Duration) -> Vec<(usize, BrokerPacket)> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let packets = self.packets();
            if packets.len() >= count || tokio::time::Instant::now() >= deadline {
                return packets;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    options: FakeBrokerOptions,
    connections: Arc<AtomicUsize>,
    packets: Recorded,
) {
    // Dropped with this task, which aborts every connection
    let mut sessions = JoinSet::new();
    loop {
        let Ok((stream, _)) = listener.accept().await else {
            break;
        };
        let index = connections.fetch_add(1, Ordering::SeqCst);
        let options = options.clone();
        let packets = packets.clone();
        sessions.spawn(async move {
            if let Err(e) = serve(stream, index, &options, &packets).await {
                debug!(connection = index, error = %e, "Fake broker connection ended");
            }
        });
    }
}

async fn serve(
    mut stream: TcpStream,
    index: usize,
    options: &FakeBrokerOptions,
    packets: &Recorded,
) -> io::Result<()> {
    let (header, _) = read_packet(&mut stream).await?;
    if header >> 4 != CONNECT {
        return Err(invalid("expected CONNECT"));
    }
    tokio::time::sleep(options.connack_delay).await;
    stream.write_all(&CONNACK).await?;

    let mut received = 0;
    loop {
        let (header, body) = read_packet(&mut stream).await?;
        match header >> 4 {
            SUBSCRIBE => {
                let (packet_id, filter, qos) = parse_subscribe(&body).ok_or_else(|| invalid("bad SUBSCRIBE"))?;
                lock(packets).push((index, BrokerPacket::Subscribe { filter }));
                received += 1;
                if drops_here(index, received, options) {
                    return Ok(());
                }
                let [hi, lo] = packet_id.to_be_bytes();
                stream.write_all(&[0x90, 4, hi, lo, 0, qos]).await?;
            }
            PUBLISH => {
                let qos = (header >> 1) & 0x03;
                let retain = header & 0x01 == 1;
                let (packet_id, topic, payload) =
                    parse_publish(&body, qos).ok_or_else(|| invalid("bad PUBLISH"))?;
                lock(packets).push((
                    index,
                    BrokerPacket::Publish {
                        topic,
                        payload,
                        retain,
                    },
                ));
                received += 1;
                if drops_here(index, received, options) {
                    return Ok(());
                }
                if let Some(packet_id) = packet_id {
                    let [hi, lo] = packet_id.to_be_bytes();
                    stream.write_all(&[0x40, 4, hi, lo, 0, 0]).await?;
                }
            }
            PINGREQ => stream.write_all(&PINGRESP).await?,
            DISCONNECT => {
                lock(packets).push((index, BrokerPacket::Disconnect));
                return Ok(());
            }
            _ => {}
        }
    }
}

fn drops_here(index: usize, received: usize, options: &FakeBrokerOptions) -> bool {
    index == 0 && options.drop_first_after == Some(received)
}

fn invalid(message: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.to_string())
}

async fn read_packet(stream: &mut TcpStream) -> io::Result<(u8, Vec<u8>)> {
    let header = stream.read_u8().await?;
    let mut remaining = 0usize;
    let mut shift = 0;
    loop {
        let byte = stream.read_u8().await?;
        remaining |= usize::from(byte & 0x7F) << shift;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
        if shift > 21 {
            return Err(invalid("remaining length too long"));
        }
    }
    let mut body = vec![0; remaining];
    stream.read_exact(&mut body).await?;
    Ok((header, body))
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Option<&'a [u8]> {
        let slice = self.bytes.get(self.pos..self.pos.checked_add(len)?)?;
        self.pos += len;
        Some(slice)
    }

    fn u8(&mut self) -> Option<u8> {
        self.take(1).map(|bytes| bytes[0])
    }

    fn u16(&mut self) -> Option<u16> {
        self.take(2).map(|bytes| u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn string(&mut self) -> Option<String> {
        let len = usize::from(self.u16()?);
        String::from_utf8(self.take(len)?.to_vec()).ok()
    }

    fn varint(&mut self) -> Option<usize> {
        let mut value = 0usize;
        for shift in [0, 7, 14, 21] {
            let byte = self.u8()?;
            value |= usize::from(byte & 0x7F) << shift;
            if byte & 0x80 == 0 {
                return Some(value);
            }
        }
        None
    }

    fn skip_properties(&mut self) -> Option<()> {
        let len = self.varint()?;
        self.take(len).map(|_| ())
    }

    fn rest(&mut self) -> &'a [u8] {
        let rest = &self.bytes[self.pos.min(self.bytes.len())..];
        self.pos = self.bytes.len();
        rest
    }
}

/// First topic filter of a SUBSCRIBE and its requested QoS
fn parse_subscribe(body: &[u8]) -> Option<(u16, String, u8)> {
    let mut reader = Reader::new(body);
    let packet_id = reader.u16()?;
    reader.skip_properties()?;
    let filter = reader.string()?;
    let options = reader.u8()?;
    Some((packet_id, filter, options & 0x03))
}

fn parse_publish(body: &[u8], qos: u8) -> Option<(Option<u16>, String, Vec<u8>)> {
    let mut reader = Reader::new(body);
    let topic = reader.string()?;
    let packet_id = if qos > 0 { Some(reader.u16()?) } else { None };
    reader.skip_properties()?;
    Some((packet_id, topic, reader.rest().to_vec()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_subscribe() {
        // packet id 7, no properties, "a/+" with QoS 1
        let body = [0, 7, 0, 0, 3, b'a', b'/', b'+', 0x01];
        assert_eq!(parse_subscribe(&body), Some((7, "a/+".to_string(), 1)));
        assert_eq!(parse_subscribe(&body[..4]), None);
    }

    #[test]
    fn test_parse_publish() {
        // "a/b", packet id 3, no properties, payload "ON"
        let body = [0, 3, b'a', b'/', b'b', 0, 3, 0, b'O', b'N'];
        assert_eq!(
            parse_publish(&body, 1),
            Some((Some(3), "a/b".to_string(), b"ON".to_vec()))
        );

        let body = [0, 1, b'x', 0, b'1'];
        assert_eq!(parse_publish(&body, 0), Some((None, "x".to_string(), b"1".to_vec())));
    }

    #[test]
    fn test_varint_limits() {
        let mut reader = Reader::new(&[0x80, 0x01]);
        assert_eq!(reader.varint(), Some(128));
        let mut reader = Reader::new(&[0xFF, 0xFF, 0xFF, 0xFF, 0x01]);
        assert_eq!(reader.varint(), None);
    }
}
