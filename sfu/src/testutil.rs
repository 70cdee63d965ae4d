//! Scripted doubles for the transport and signalling seams, shared by the
//! actor tests.

use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use url::Url;
use webrtc::rtcp;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::TrackLocal;

use crate::{
	Error, IncomingTrack, MediaSender, MediaSession, ParticipantId, RelaySink, RemoteMedia, Result, SessionEventSink,
	SessionFactory, SessionStatus, Signal, SignalConnection, SignalDialer, SignalSink, SignalStream, TrackKind,
	TransceiverDirection,
};

#[derive(Default)]
pub(crate) struct MockSessionState {
	pub unstable: bool,
	pub terminated: bool,
	pub closed: bool,
	pub fail_add_sender: bool,

	pub local_descriptions: Vec<String>,
	pub remote_descriptions: Vec<String>,
	pub candidates: Vec<String>,
	pub transceivers: Vec<(TrackKind, TransceiverDirection)>,
	pub data_channels: Vec<String>,
	pub senders: Vec<Arc<MockSender>>,
	pub keyframe_requests: usize,
	pub rtcp_batches: usize,

	offers: usize,
	answers: usize,
}

pub(crate) struct MockSession {
	pub label: String,
	pub state: Mutex<MockSessionState>,
}

impl MockSession {
	fn new(label: &str) -> Arc<Self> {
		Arc::new(Self {
			label: label.to_string(),
			state: Mutex::new(MockSessionState::default()),
		})
	}

	pub fn lock(&self) -> std::sync::MutexGuard<'_, MockSessionState> {
		self.state.lock().unwrap()
	}
}

pub(crate) struct MockSender {
	pub id: String,
	pub live: AtomicBool,
}

#[async_trait]
impl MediaSender for MockSender {
	async fn has_track(&self) -> bool {
		self.live.load(Ordering::SeqCst)
	}

	async fn track_id(&self) -> Option<String> {
		self.live.load(Ordering::SeqCst).then(|| self.id.clone())
	}

	fn as_any(&self) -> &(dyn Any + Send + Sync) {
		self
	}
}

#[async_trait]
impl MediaSession for MockSession {
	async fn create_offer(&self) -> Result<String> {
		let mut state = self.lock();
		state.offers += 1;
		Ok(format!("offer-{}", state.offers))
	}

	async fn create_answer(&self) -> Result<String> {
		let mut state = self.lock();
		state.answers += 1;
		Ok(format!("answer-{}", state.answers))
	}

	async fn set_local_description(&self, sdp: &str) -> Result<()> {
		self.lock().local_descriptions.push(sdp.to_string());
		Ok(())
	}

	async fn set_remote_description(&self, sdp: &str) -> Result<()> {
		self.lock().remote_descriptions.push(sdp.to_string());
		Ok(())
	}

	async fn add_ice_candidate(&self, candidate: &str) -> Result<()> {
		self.lock().candidates.push(candidate.to_string());
		Ok(())
	}

	async fn create_data_channel(&self, label: &str) -> Result<()> {
		self.lock().data_channels.push(label.to_string());
		Ok(())
	}

	async fn add_transceiver(&self, kind: TrackKind, direction: TransceiverDirection) -> Result<()> {
		self.lock().transceivers.push((kind, direction));
		Ok(())
	}

	async fn add_sender(&self, relay: &RelaySink) -> Result<Arc<dyn MediaSender>> {
		let mut state = self.lock();
		if state.fail_add_sender {
			return Err(Error::ForeignSender);
		}

		let sender = Arc::new(MockSender {
			id: relay.local().id().to_string(),
			live: AtomicBool::new(true),
		});
		state.senders.push(sender.clone());
		Ok(sender)
	}

	async fn remove_sender(&self, sender: &Arc<dyn MediaSender>) -> Result<()> {
		let sender = sender.as_any().downcast_ref::<MockSender>().ok_or(Error::ForeignSender)?;
		sender.live.store(false, Ordering::SeqCst);

		let mut state = self.lock();
		state.senders.retain(|s| s.id != sender.id);
		Ok(())
	}

	async fn sender_mid(&self, sender: &Arc<dyn MediaSender>) -> Option<String> {
		let sender = sender.as_any().downcast_ref::<MockSender>()?;
		let state = self.lock();
		state
			.senders
			.iter()
			.position(|s| s.id == sender.id)
			.map(|index| index.to_string())
	}

	fn signaling_stable(&self) -> bool {
		!self.lock().unstable
	}

	fn is_terminated(&self) -> bool {
		self.lock().terminated
	}

	async fn request_keyframes(&self) {
		self.lock().keyframe_requests += 1;
	}

	async fn write_rtcp(&self, _packets: &[Box<dyn rtcp::packet::Packet + Send + Sync>]) -> Result<()> {
		self.lock().rtcp_batches += 1;
		Ok(())
	}

	async fn status(&self) -> SessionStatus {
		SessionStatus {
			connection_state: "mock".to_string(),
			..Default::default()
		}
	}

	async fn close(&self) -> Result<()> {
		self.lock().closed = true;
		Ok(())
	}
}

/// Records every created session together with its event sink, so tests can
/// fire transport events at the participant.
#[derive(Default)]
pub(crate) struct MockFactory {
	pub created: Mutex<Vec<(Arc<MockSession>, SessionEventSink)>>,
}

impl MockFactory {
	/// Sessions are created inbound first, outbound second.
	pub fn session(&self, index: usize) -> (Arc<MockSession>, SessionEventSink) {
		let created = self.created.lock().unwrap();
		let (session, sink) = &created[index];
		(session.clone(), sink.clone())
	}
}

#[async_trait]
impl SessionFactory for MockFactory {
	async fn create(&self, label: &str, events: SessionEventSink) -> Result<Arc<dyn MediaSession>> {
		let session = MockSession::new(label);
		self.created.lock().unwrap().push((session.clone(), events));
		Ok(session)
	}
}

/// A remote media stream whose mid can be bound later. Reads block forever.
pub(crate) struct MockRemote {
	pub id: String,
	pub stream_id: String,
	pub kind: TrackKind,
	pub ssrc: u32,
	pub mid: Mutex<Option<String>>,
}

impl MockRemote {
	pub fn video(id: &str, mid: Option<&str>) -> Arc<Self> {
		Arc::new(Self {
			id: id.to_string(),
			stream_id: format!("{id}-stream"),
			kind: TrackKind::Video,
			ssrc: 0x1234,
			mid: Mutex::new(mid.map(|mid| mid.to_string())),
		})
	}
}

#[async_trait]
impl RemoteMedia for MockRemote {
	fn id(&self) -> String {
		self.id.clone()
	}

	fn stream_id(&self) -> String {
		self.stream_id.clone()
	}

	fn kind(&self) -> TrackKind {
		self.kind
	}

	fn ssrc(&self) -> u32 {
		self.ssrc
	}

	fn rtx_ssrc(&self) -> Option<u32> {
		None
	}

	fn mid(&self) -> Option<String> {
		self.mid.lock().unwrap().clone()
	}

	fn codec(&self) -> RTCRtpCodecCapability {
		RTCRtpCodecCapability {
			mime_type: "video/H264".to_string(),
			clock_rate: 90000,
			..Default::default()
		}
	}

	async fn read(&self, _buf: &mut [u8]) -> Result<usize> {
		futures::future::pending().await
	}

	async fn read_rtcp(&self) -> Result<Vec<Box<dyn rtcp::packet::Packet + Send + Sync>>> {
		futures::future::pending().await
	}
}

struct PipeSink {
	tx: mpsc::UnboundedSender<Bytes>,
}

#[async_trait]
impl SignalSink for PipeSink {
	async fn send(&mut self, frame: Bytes) -> Result<()> {
		self.tx.send(frame).map_err(|_| Error::SignalClosed)
	}

	async fn close(&mut self) {}
}

struct PipeStream {
	rx: mpsc::UnboundedReceiver<Bytes>,
}

#[async_trait]
impl SignalStream for PipeStream {
	async fn recv(&mut self) -> Result<Option<Bytes>> {
		Ok(self.rx.recv().await)
	}
}

/// The far end of an in-memory signalling channel.
pub(crate) struct RemotePeer {
	tx: mpsc::UnboundedSender<Bytes>,
	rx: mpsc::UnboundedReceiver<Bytes>,
}

impl RemotePeer {
	pub fn send(&self, signal: &Signal) {
		self.tx.send(signal.to_frame()).expect("participant gone");
	}

	pub fn send_raw(&self, frame: Bytes) {
		self.tx.send(frame).expect("participant gone");
	}

	pub async fn recv(&mut self) -> Signal {
		let frame = self.rx.recv().await.expect("channel closed");
		Signal::from_frame(&frame).expect("bad frame")
	}

	pub fn try_recv(&mut self) -> Option<Signal> {
		self.rx
			.try_recv()
			.ok()
			.map(|frame| Signal::from_frame(&frame).expect("bad frame"))
	}

	pub fn hang_up(&mut self) {
		// Replacing (and thereby dropping) both channel halves closes the
		// connection from the remote end, same as dropping `self` used to.
		let (tx, rx) = mpsc::unbounded_channel();
		self.tx = tx;
		self.rx = rx;
	}
}

/// An in-memory signalling channel: the connection for the participant and
/// the remote end for the test.
pub(crate) fn signal_pipe() -> (SignalConnection, RemotePeer) {
	let (to_participant_tx, to_participant_rx) = mpsc::unbounded_channel();
	let (from_participant_tx, from_participant_rx) = mpsc::unbounded_channel();

	let connection = SignalConnection {
		sink: Box::new(PipeSink { tx: from_participant_tx }),
		stream: Box::new(PipeStream { rx: to_participant_rx }),
	};

	let remote = RemotePeer {
		tx: to_participant_tx,
		rx: from_participant_rx,
	};

	(connection, remote)
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ScriptedCall {
	AddOutgoing(String),
	RemoveOutgoing(String),
	RequestEval,
	Stop,
}

/// A controller-side member that records every capability call.
pub(crate) struct ScriptedMember {
	id: ParticipantId,
	label: String,
	calls: mpsc::UnboundedSender<ScriptedCall>,
}

impl ScriptedMember {
	pub fn new(label: &str) -> (Self, mpsc::UnboundedReceiver<ScriptedCall>) {
		let (tx, rx) = mpsc::unbounded_channel();
		(
			Self {
				id: ParticipantId::next(),
				label: label.to_string(),
				calls: tx,
			},
			rx,
		)
	}

	pub fn id(&self) -> ParticipantId {
		self.id
	}

	pub fn label(&self) -> &str {
		&self.label
	}

	pub fn stop(&self) {
		self.calls.send(ScriptedCall::Stop).ok();
	}

	pub fn add_outgoing(&self, track: &IncomingTrack) {
		self.calls
			.send(ScriptedCall::AddOutgoing(track.umbrella_id().to_string()))
			.ok();
	}

	pub fn remove_outgoing(&self, umbrella_id: &str) {
		self.calls
			.send(ScriptedCall::RemoveOutgoing(umbrella_id.to_string()))
			.ok();
	}

	pub fn request_eval(&self) {
		self.calls.send(ScriptedCall::RequestEval).ok();
	}
}

/// A dialer that always fails, counting the attempts.
#[derive(Default)]
pub(crate) struct CountingDialer {
	dials: AtomicUsize,
}

impl CountingDialer {
	pub fn count(&self) -> usize {
		self.dials.load(Ordering::SeqCst)
	}
}

#[async_trait]
impl SignalDialer for CountingDialer {
	async fn dial(&self, url: &Url) -> Result<SignalConnection> {
		self.dials.fetch_add(1, Ordering::SeqCst);
		Err(Error::Dial(format!("refusing {url}")))
	}
}
