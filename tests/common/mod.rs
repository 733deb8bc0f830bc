//! Two sessions over in-memory transports, plus a relay standing in for the
//! rendezvous channel.

#![allow(dead_code)]

use parking_lot::Mutex;
use peerlink::transport::{MemoryTransport, MemoryTransportFactory};
use peerlink::{Description, EventKind, SdpType, Session, SessionConfig, SessionEvent};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;

pub const WAIT: Duration = Duration::from_secs(3);

pub struct Peer {
    pub session: Session,
    pub factory: Arc<MemoryTransportFactory>,
    pub log: Arc<Mutex<Vec<SessionEvent>>>,
    outbox: Option<UnboundedReceiver<SessionEvent>>,
}

impl Peer {
    pub async fn new(config: SessionConfig) -> Self {
        let factory = MemoryTransportFactory::new();
        let session = Session::new(config, factory.clone())
            .await
            .expect("session");

        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        session.on_any(move |event| sink.lock().push(event.clone()));
        let (_, outbox) = session.listen();

        Self {
            session,
            factory,
            log,
            outbox: Some(outbox),
        }
    }

    pub fn transport(&self) -> Arc<MemoryTransport> {
        self.factory.last().expect("transport")
    }

    pub fn count(&self, kind: EventKind) -> usize {
        self.log.lock().iter().filter(|e| e.kind() == kind).count()
    }

    pub fn signals(&self, kind: SdpType) -> usize {
        self.log
            .lock()
            .iter()
            .filter(|e| matches!(e, SessionEvent::Signal(d) if d.kind == kind))
            .count()
    }

    pub fn errors(&self) -> Vec<String> {
        self.log
            .lock()
            .iter()
            .filter_map(|e| match e {
                SessionEvent::Error(fault) => Some(fault.to_string()),
                _ => None,
            })
            .collect()
    }

    pub fn saw(&self, pred: impl Fn(&SessionEvent) -> bool) -> bool {
        self.log.lock().iter().any(pred)
    }

    /// Pull outgoing events until the next description
    pub async fn next_signal(&mut self) -> Description {
        let outbox = self.outbox.as_mut().expect("relay already running");
        tokio::time::timeout(WAIT, async {
            loop {
                match outbox.recv().await {
                    Some(SessionEvent::Signal(description)) => return description,
                    Some(_) => continue,
                    None => panic!("event stream closed"),
                }
            }
        })
        .await
        .expect("no signal in time")
    }

    /// Forward this peer's signals and candidates to `to`
    pub fn relay_to(&mut self, to: &Peer) -> JoinHandle<()> {
        let mut outbox = self.outbox.take().expect("relay already running");
        let to = to.session.clone();
        tokio::spawn(async move {
            while let Some(event) = outbox.recv().await {
                match event {
                    SessionEvent::Signal(description) => {
                        let _ = to.signal(description).await;
                    }
                    SessionEvent::IceCandidates(candidates) => {
                        let _ = to.add_ice_candidates(candidates).await;
                    }
                    _ => {}
                }
            }
        })
    }

    pub async fn wait_for(&self, what: &str, pred: impl Fn(&Peer) -> bool) {
        let deadline = tokio::time::Instant::now() + WAIT;
        while !pred(self) {
            if tokio::time::Instant::now() > deadline {
                panic!("timed out waiting for {what}; events: {:?}", self.log.lock());
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub async fn wait_connected(&self) {
        self.wait_for("connected", |p| p.count(EventKind::Connected) > 0)
            .await;
    }
}

/// Relay both directions
pub fn link(a: &mut Peer, b: &mut Peer) -> (JoinHandle<()>, JoinHandle<()>) {
    (a.relay_to(b), b.relay_to(a))
}

/// A started by itself, both connected
pub async fn connected_pair(a_config: SessionConfig, b_config: SessionConfig) -> (Peer, Peer) {
    let mut a = Peer::new(a_config).await;
    let mut b = Peer::new(b_config).await;
    link(&mut a, &mut b);
    a.session.start(Default::default()).await.expect("start");
    a.wait_connected().await;
    b.wait_connected().await;
    (a, b)
}
