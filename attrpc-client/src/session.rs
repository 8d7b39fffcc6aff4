//! Opening a ready-to-use session from configuration.

use crate::client::RpcClient;
use crate::config::{Backend, Config};
use crate::error::ClientError;
use attrpc_link::{AnyLink, AttLink, BusLink, Link};

/// Connects the configured backend and prepares it for requests.
///
/// The link is connected, the unit negotiated with `rpc.preferred_mtu` and
/// delivery enabled before the client is returned. On failure after connect
/// the link is disconnected again.
pub async fn open(config: &Config) -> Result<RpcClient<AnyLink>, ClientError> {
    config.validate()?;

    let mut link: AnyLink = match config.backend {
        Backend::Att => AttLink::connect(&config.att).await?.into(),
        Backend::Bus => BusLink::connect(&config.bus).await?.into(),
    };

    if let Err(e) = prepare(&mut link, config).await {
        if let Err(close_err) = link.disconnect().await {
            tracing::debug!("Disconnect after failed setup also failed: {}", close_err);
        }
        return Err(e);
    }

    Ok(RpcClient::new(link, &config.rpc))
}

/// Negotiates the unit and enables delivery on a connected link.
pub async fn prepare<L: Link>(link: &mut L, config: &Config) -> Result<(), ClientError> {
    let mtu = link.negotiate_unit(config.rpc.preferred_mtu).await?;
    link.enable_delivery().await?;
    tracing::debug!(
        "Session ready: {:?} backend, MTU {}, unit {}",
        config.backend,
        mtu,
        link.unit()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use attrpc_link::att::Pdu;
    use attrpc_link::{AttBearer, AttConfig, DeliveryKind};
    use attrpc_protocol::{frame, Envelope, PrefixedEnvelope, Reassembler, Reassembly};
    use bytes::Bytes;
    use std::collections::VecDeque;
    use std::io;
    use tracing_subscriber::EnvFilter;

    fn assert_send<T: Send>() {}

    #[test]
    fn test_session_client_is_send() {
        assert_send::<RpcClient<AnyLink>>();
    }

    // Full request/response runs over an ATT link to a simulated peripheral.

    const DATA_HANDLE: u16 = 0x0020;
    const CCCD_HANDLE: u16 = 0x0021;

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")),
            )
            .with_test_writer()
            .try_init();
    }

    /// A peripheral that answers each complete request frame with
    /// `b"re:" + request body` under the same correlation id.
    struct Peripheral {
        mtu: u16,
        delivery: Option<DeliveryKind>,
        inbound: Reassembler,
        outbox: VecDeque<Bytes>,
        /// Frames pushed before the next reply, as if left over from earlier.
        stale: Vec<Bytes>,
        /// Replies withheld for these ids.
        silent_ids: Vec<u32>,
        confirmations: usize,
    }

    impl Peripheral {
        fn new(mtu: u16) -> Self {
            Self {
                mtu,
                delivery: None,
                inbound: Reassembler::new(),
                outbox: VecDeque::new(),
                stale: Vec::new(),
                silent_ids: Vec::new(),
                confirmations: 0,
            }
        }

        fn queue(&mut self, pdu: Pdu) {
            self.outbox.push_back(pdu.encode());
        }

        fn push_frame(&mut self, framed: &[u8], unit: usize) {
            for chunk in framed.chunks(unit) {
                let value = Bytes::copy_from_slice(chunk);
                let pdu = match self.delivery {
                    Some(DeliveryKind::Indication) => Pdu::Indication {
                        handle: DATA_HANDLE,
                        value,
                    },
                    _ => Pdu::Notification {
                        handle: DATA_HANDLE,
                        value,
                    },
                };
                self.queue(pdu);
            }
        }

        fn on_request_frame(&mut self, framed: &[u8], unit: usize) {
            let request = frame::decode(framed).expect("peripheral got a malformed frame");
            let id = PrefixedEnvelope
                .correlation_id(&request)
                .expect("request without id");

            for stale in std::mem::take(&mut self.stale) {
                self.push_frame(&stale, unit);
            }
            if self.silent_ids.contains(&id) {
                return;
            }

            let mut body = b"re:".to_vec();
            body.extend_from_slice(&request[4..]);
            let reply = frame::encode(&PrefixedEnvelope.seal(id, &body));
            self.push_frame(&reply, unit);
        }
    }

    impl AttBearer for Peripheral {
        async fn send_pdu(&mut self, pdu: &[u8]) -> io::Result<()> {
            let pdu = Pdu::decode(pdu).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            match pdu {
                Pdu::ExchangeMtuRequest { mtu } => {
                    self.mtu = self.mtu.min(mtu);
                    self.queue(Pdu::ExchangeMtuResponse { mtu: self.mtu });
                }
                Pdu::WriteRequest { handle, value } if handle == CCCD_HANDLE => {
                    self.delivery = match value.first() {
                        Some(0x01) => Some(DeliveryKind::Notification),
                        Some(0x02) => Some(DeliveryKind::Indication),
                        _ => None,
                    };
                    self.queue(Pdu::WriteResponse);
                }
                Pdu::WriteRequest { handle, value } if handle == DATA_HANDLE => {
                    self.queue(Pdu::WriteResponse);
                    let unit = usize::from(self.mtu) - 3;
                    match self.inbound.push(&value) {
                        Ok(Reassembly::Complete(framed)) => self.on_request_frame(&framed, unit),
                        Ok(Reassembly::Incomplete) => {}
                        Err(e) => panic!("peripheral reassembly failed: {}", e),
                    }
                }
                Pdu::Confirmation => self.confirmations += 1,
                other => self.queue(Pdu::ErrorResponse {
                    request: other.opcode(),
                    handle: 0,
                    code: 0x06,
                }),
            }
            Ok(())
        }

        async fn recv_pdu(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.outbox.pop_front() {
                Some(pdu) => {
                    buf[..pdu.len()].copy_from_slice(&pdu);
                    Ok(pdu.len())
                }
                None => std::future::pending().await,
            }
        }
    }

    fn config() -> Config {
        let mut config = Config::default();
        config.att = AttConfig::new("C0:FF:EE:00:11:22".parse().unwrap(), DATA_HANDLE);
        config.rpc.preferred_mtu = 64;
        config
    }

    async fn ready_client(
        peripheral: Peripheral,
        config: &Config,
    ) -> RpcClient<AttLink<Peripheral>> {
        let mut link = AttLink::from_bearer(peripheral, config.att.clone());
        prepare(&mut link, config).await.unwrap();
        RpcClient::new(link, &config.rpc)
    }

    #[tokio::test]
    async fn test_round_trip_over_small_mtu() {
        init_tracing();
        let config = config();
        let mut client = ready_client(Peripheral::new(23), &config).await;
        assert_eq!(client.link().mtu(), 23);
        assert_eq!(client.link().unit(), 20);

        // Marker bytes in the payload get escaped and the reply spans many PDUs.
        let payload: Vec<u8> = (0u8..120).collect();
        let reply = client.send(&payload).await.unwrap();

        assert_eq!(reply.id, 1);
        assert_eq!(&reply.payload[4..7], b"re:");
        assert_eq!(&reply.payload[7..], &payload[..]);
        assert!(client.stats().fragments > 1);
    }

    #[tokio::test]
    async fn test_negotiated_mtu_and_sequential_ids() {
        init_tracing();
        let config = config();
        let mut client = ready_client(Peripheral::new(185), &config).await;
        assert_eq!(client.link().mtu(), 64);

        for expected in 1..=3u32 {
            let reply = client.send(b"status").await.unwrap();
            assert_eq!(reply.id, expected);
            assert_eq!(&reply.payload[4..], b"re:status");
        }
        assert_eq!(client.stats().requests, 3);
        assert_eq!(client.stats().correlation_misses, 0);
    }

    #[tokio::test]
    async fn test_stale_frame_before_reply_is_dropped() {
        init_tracing();
        let config = config();
        let mut peripheral = Peripheral::new(64);
        peripheral.stale = vec![frame::encode(&PrefixedEnvelope.seal(99, b"old news"))];
        let mut client = ready_client(peripheral, &config).await;

        let reply = client.send(b"now").await.unwrap();
        assert_eq!(reply.id, 1);
        assert_eq!(&reply.payload[4..], b"re:now");
        assert_eq!(client.stats().correlation_misses, 1);
    }

    #[tokio::test]
    async fn test_indications_confirmed_end_to_end() {
        init_tracing();
        let mut config = config();
        config.att.delivery = DeliveryKind::Indication;
        let mut client = ready_client(Peripheral::new(23), &config).await;

        let reply = client.send(&[0x42; 40]).await.unwrap();
        assert_eq!(&reply.payload[7..], &[0x42; 40][..]);

        let fragments = client.stats().fragments as usize;
        let link = client.into_link();
        assert_eq!(link.bearer().unwrap().confirmations, fragments);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_then_next_request_succeeds() {
        init_tracing();
        let mut config = config();
        config.rpc.request_timeout_ms = 500;
        let mut peripheral = Peripheral::new(64);
        peripheral.silent_ids = vec![1];
        let mut client = ready_client(peripheral, &config).await;

        let err = client.send(b"first").await.unwrap_err();
        assert!(matches!(err, ClientError::Timeout));
        assert!(client.pending().is_none());

        let reply = client.send(b"second").await.unwrap();
        assert_eq!(reply.id, 2);
        assert_eq!(&reply.payload[4..], b"re:second");
        assert_eq!(client.stats().timeouts, 1);
    }

    #[tokio::test]
    async fn test_close_ends_session() {
        init_tracing();
        let config = config();
        let mut client = ready_client(Peripheral::new(64), &config).await;

        client.close().await.unwrap();
        assert!(!client.link().is_connected());
        assert!(matches!(
            client.send(b"after").await,
            Err(ClientError::NotConnected)
        ));
    }
}
