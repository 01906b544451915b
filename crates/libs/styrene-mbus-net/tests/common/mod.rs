#![allow(dead_code)]

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use mbus::{BusError, Message, Protocol, Reply, Routable, Version};
use mbus_net::{
    LocalNameServer, LoopbackNet, LoopbackTransport, NetworkConfig, NetworkOwner, ReplySink,
    RecipientToken, RpcNetwork,
};

pub const TEXT: &str = "text";
pub const WAIT: Duration = Duration::from_secs(5);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Text(pub String);

impl Routable for Text {
    fn protocol(&self) -> &str {
        TEXT
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// UTF-8 protocol that records the versions it was asked to encode/decode at.
#[derive(Default)]
pub struct TextProtocol {
    pub sequenced: bool,
    pub encoded: Mutex<Vec<Version>>,
    pub decoded: Mutex<Vec<Version>>,
}

impl TextProtocol {
    pub fn encoded(&self) -> Vec<Version> {
        self.encoded.lock().expect("encoded").clone()
    }

    pub fn decoded(&self) -> Vec<Version> {
        self.decoded.lock().expect("decoded").clone()
    }
}

impl Protocol for TextProtocol {
    fn name(&self) -> &str {
        TEXT
    }

    fn encode(&self, version: &Version, routable: &dyn Routable) -> Result<Vec<u8>, BusError> {
        let text = routable
            .as_any()
            .downcast_ref::<Text>()
            .ok_or_else(|| BusError::Encode("not a text routable".into()))?;
        self.encoded.lock().expect("encoded").push(*version);
        Ok(text.0.as_bytes().to_vec())
    }

    fn decode(&self, version: &Version, payload: &[u8]) -> Result<Box<dyn Routable>, BusError> {
        self.decoded.lock().expect("decoded").push(*version);
        let text = String::from_utf8(payload.to_vec()).map_err(|err| BusError::Decode(err.to_string()))?;
        Ok(Box::new(Text(text)))
    }

    fn requires_sequencing(&self) -> bool {
        self.sequenced
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Behaviour {
    /// Replies `echo:<body>` immediately.
    Echo,
    /// Keeps every reply sink without answering.
    Hold,
}

#[derive(Debug)]
pub struct Received {
    pub session: String,
    pub body: String,
    pub metadata: BTreeMap<String, String>,
}

pub struct TestOwner {
    behaviour: Behaviour,
    protocols: HashMap<String, Arc<dyn Protocol>>,
    replies: Mutex<mpsc::Sender<(RecipientToken, Reply)>>,
    pub received: Mutex<Vec<Received>>,
    pub held: Mutex<Vec<ReplySink>>,
}

impl NetworkOwner for TestOwner {
    fn protocol(&self, name: &str) -> Option<Arc<dyn Protocol>> {
        self.protocols.get(name).cloned()
    }

    fn deliver_message(&self, message: Message, session: &str, reply: ReplySink) {
        let body = message
            .routable
            .as_any()
            .downcast_ref::<Text>()
            .map(|text| text.0.clone())
            .unwrap_or_default();
        self.received.lock().expect("received").push(Received {
            session: session.to_owned(),
            body: body.clone(),
            metadata: message.metadata,
        });
        match self.behaviour {
            Behaviour::Echo => reply.reply(Reply::new(Box::new(Text(format!("echo:{body}"))))),
            Behaviour::Hold => self.held.lock().expect("held").push(reply),
        }
    }

    fn deliver_reply(&self, reply: Reply, token: RecipientToken) {
        let _ = self.replies.lock().expect("replies").send((token, reply));
    }
}

pub struct Node {
    pub network: RpcNetwork,
    pub owner: Arc<TestOwner>,
    pub protocol: Arc<TextProtocol>,
    pub replies: mpsc::Receiver<(RecipientToken, Reply)>,
}

pub struct NodeBuilder {
    identity: String,
    version: Version,
    behaviour: Behaviour,
    knows_text: bool,
    sequenced: bool,
}

impl NodeBuilder {
    pub fn new(identity: &str) -> Self {
        Self {
            identity: identity.to_owned(),
            version: Version::new(8, 0, 0),
            behaviour: Behaviour::Echo,
            knows_text: true,
            sequenced: false,
        }
    }

    pub fn version(mut self, version: Version) -> Self {
        self.version = version;
        self
    }

    pub fn behaviour(mut self, behaviour: Behaviour) -> Self {
        self.behaviour = behaviour;
        self
    }

    pub fn without_protocols(mut self) -> Self {
        self.knows_text = false;
        self
    }

    pub fn sequenced(mut self) -> Self {
        self.sequenced = true;
        self
    }

    pub fn start(self, net: &Arc<LoopbackNet>, names: &Arc<LocalNameServer>) -> Node {
        let mut config = NetworkConfig::new(self.identity);
        config.set_version(self.version);
        config.set_executor_threads(2);
        let transport = Arc::new(LoopbackTransport::new(net, &config.hostname, 0));
        let network =
            RpcNetwork::new(config, transport, names.clone(), names.clone()).expect("network");

        let protocol = Arc::new(TextProtocol { sequenced: self.sequenced, ..TextProtocol::default() });
        let mut protocols: HashMap<String, Arc<dyn Protocol>> = HashMap::new();
        if self.knows_text {
            protocols.insert(TEXT.to_owned(), protocol.clone());
        }
        let (tx, replies) = mpsc::channel();
        let owner = Arc::new(TestOwner {
            behaviour: self.behaviour,
            protocols,
            replies: Mutex::new(tx),
            received: Mutex::new(Vec::new()),
            held: Mutex::new(Vec::new()),
        });
        let bus: Arc<dyn NetworkOwner> = owner.clone();
        network.attach(&bus).expect("attach");
        network.start().expect("start");
        network.register_session("session");
        Node { network, owner, protocol, replies }
    }
}

impl Node {
    /// The name other nodes resolve to reach this node's session.
    pub fn service(&self) -> String {
        format!("{}/session", self.network.identity())
    }

    pub fn next_reply(&self) -> (RecipientToken, Reply) {
        self.replies.recv_timeout(WAIT).expect("reply within deadline")
    }

    /// Collects `count` replies ordered by recipient token.
    pub fn replies(&self, count: usize) -> Vec<(RecipientToken, Reply)> {
        let mut replies: Vec<_> = (0..count).map(|_| self.next_reply()).collect();
        replies.sort_by_key(|(token, _)| *token);
        replies
    }

    pub fn received_count(&self) -> usize {
        self.owner.received.lock().expect("received").len()
    }

    pub fn held_count(&self) -> usize {
        self.owner.held.lock().expect("held").len()
    }

    pub fn teardown(&self) {
        self.network.shutdown();
        self.network.post_shutdown_hook();
    }
}

pub fn text_message(body: &str, time_remaining: Duration) -> Message {
    Message::new(Box::new(Text(body.to_owned())), time_remaining)
}

pub fn reply_text(reply: &Reply) -> Option<String> {
    reply.routable.as_ref()?.as_any().downcast_ref::<Text>().map(|text| text.0.clone())
}

pub fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}
