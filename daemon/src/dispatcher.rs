// ======================================================================
//  Dispatcher (sole owner of the link)
// ======================================================================

use crate::link::{LinkClient, LinkTransport};
use crate::shutdown::ShutdownListener;
use crate::sink::TelemetrySink;
use cdh_shared::command::split_keyword;
use cdh_shared::{Catalog, CodecError, HELP_KEYWORD, Message, MessageKind, to_telemetry_line};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tracing::{debug, info, trace, warn};

pub const HELP_HEADER: &str = "Available commands (array elements should be passed inside quotes \" \"):\n";

pub fn get_current_timestamp_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

#[derive(Debug, Clone, PartialEq)]
pub enum CommandOutcome {
    Help(String),
    Rejected(CodecError),
    Acknowledged(&'static str),
    NotAcknowledged(&'static str),
}

impl CommandOutcome {
    pub fn reply_text(&self, source_tag: &str) -> String {
        match self {
            CommandOutcome::Help(text) => text.clone(),
            CommandOutcome::Rejected(err) => {
                format!("ERROR: {err}\nYou can list available commands with 'help'\n")
            }
            CommandOutcome::Acknowledged(name) => format!("{name} message sent\n"),
            CommandOutcome::NotAcknowledged(name) => {
                format!("ERROR: {source_tag} did not acknowledge {name}\n")
            }
        }
    }
}

pub struct Dispatcher<T: LinkTransport> {
    catalog: &'static Catalog,
    available: Vec<u8>,
    link: LinkClient<T>,
    sink: TelemetrySink,
    source_tag: String,
    clock: fn() -> u64,
}

impl<T: LinkTransport> Dispatcher<T> {
    pub fn new(
        catalog: &'static Catalog,
        available: Vec<u8>,
        link: LinkClient<T>,
        sink: TelemetrySink,
        source_tag: String,
    ) -> Self {
        Self {
            catalog,
            available,
            link,
            sink,
            source_tag,
            clock: get_current_timestamp_ns,
        }
    }

    #[cfg(test)]
    fn with_clock(mut self, clock: fn() -> u64) -> Self {
        self.clock = clock;
        self
    }

    /// Listing of the available commands, in catalog order.
    pub fn help_text(&self) -> String {
        let mut text = String::from(HELP_HEADER);
        for layout in self
            .catalog
            .commands()
            .filter(|l| self.available.contains(&l.code))
        {
            text.push_str(&layout.describe());
            text.push_str("\n\n");
        }
        text
    }

    fn parse_available(&self, text: &str) -> Result<Message, CodecError> {
        let msg = self.catalog.parse_command(text)?;
        if !self.available.contains(&msg.code()) {
            return Err(CodecError::Unavailable(msg.name()));
        }
        Ok(msg)
    }

    pub fn handle_command(&mut self, text: &str) -> CommandOutcome {
        trace!(command = text.trim_end(), "parsing");
        if split_keyword(text).is_some_and(|(keyword, _)| keyword == HELP_KEYWORD) {
            return CommandOutcome::Help(self.help_text());
        }
        let msg = match self.parse_available(text) {
            Ok(msg) => msg,
            Err(err) => {
                debug!(command = text.trim_end(), "rejected: {err}");
                return CommandOutcome::Rejected(err);
            }
        };
        trace!(name = msg.name(), "dispatching");
        if self.link.send_with_ack(&msg.encode(), true) {
            info!(name = msg.name(), "command acknowledged");
            CommandOutcome::Acknowledged(msg.name())
        } else {
            warn!(name = msg.name(), peer = %self.source_tag, "command not acknowledged");
            CommandOutcome::NotAcknowledged(msg.name())
        }
    }

    /// Forward one inbound frame, if any. Returns whether a frame was read.
    pub fn poll_link(&mut self) -> bool {
        let frame = self.link.receive_nonblocking();
        if frame.is_empty() {
            return false;
        }
        match self.catalog.decode(frame) {
            Ok(msg) if msg.kind() == MessageKind::Telemetry => {
                if let Some(field) = msg.non_finite_field() {
                    warn!(
                        name = msg.name(),
                        field,
                        "dropping frame from {}: non-finite value",
                        self.source_tag
                    );
                    return true;
                }
                trace!(name = msg.name(), "telemetry frame");
                let line = to_telemetry_line(&msg, &self.source_tag, (self.clock)());
                self.sink.publish(line);
            }
            Ok(msg) => warn!(
                code = msg.code(),
                "{} message from {} not handled",
                msg.name(),
                self.source_tag
            ),
            Err(err) => warn!("dropping frame from {}: {err}", self.source_tag),
        }
        true
    }

    /// Blocking loop; returns when shutdown is requested or a peer role is gone.
    pub fn run(
        mut self,
        mut commands: mpsc::Receiver<String>,
        replies: mpsc::Sender<String>,
        shutdown: ShutdownListener,
        idle: Duration,
    ) -> anyhow::Result<()> {
        info!(available = ?self.available, "dispatcher started");
        while !shutdown.is_triggered() {
            let mut busy = false;
            match commands.try_recv() {
                Ok(text) => {
                    busy = true;
                    let reply = self.handle_command(&text).reply_text(&self.source_tag);
                    if replies.blocking_send(reply).is_err() {
                        if shutdown.is_triggered() {
                            break;
                        }
                        anyhow::bail!("client gateway stopped taking replies");
                    }
                }
                Err(TryRecvError::Empty) => {}
                Err(TryRecvError::Disconnected) => {
                    if shutdown.is_triggered() {
                        break;
                    }
                    anyhow::bail!("client gateway command channel closed");
                }
            }
            busy |= self.poll_link();
            if !busy {
                std::thread::sleep(idle);
            }
        }
        info!("dispatcher stopping");
        self.link.shutdown();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shutdown::ShutdownSignal;
    use crate::sim_link::{AckBehavior, SimHandle, SimulatedTransport};
    use crate::sink::{TelemetryQueue, telemetry_channel};
    use cdh_shared::catalog::{ATTITUDE_ADCS, HOUSEKEEPING_ADCS, OPMODE_ADCS, SET_OPMODE};
    use cdh_shared::{FieldValue, Value};

    const TS: u64 = 1_700_000_000_000_000_000;
    const WAIT: Duration = Duration::from_millis(10);

    fn fixed_clock() -> u64 {
        TS
    }

    fn dispatcher(
        available: Vec<u8>,
    ) -> (Dispatcher<SimulatedTransport>, SimHandle, TelemetryQueue) {
        let (transport, sim) = SimulatedTransport::new(64);
        let link = LinkClient::init(transport, Duration::from_millis(20), 2).unwrap();
        let (sink, queue) = telemetry_channel(16);
        let d = Dispatcher::new(Catalog::standard(), available, link, sink, "ADCS".into())
            .with_clock(fixed_clock);
        (d, sim, queue)
    }

    fn housekeeping_frame() -> Vec<u8> {
        Message::new(
            &HOUSEKEEPING_ADCS,
            vec![
                FieldValue::Scalar(Value::F32(21.5)),
                FieldValue::Scalar(Value::F32(7.25)),
                FieldValue::Scalar(Value::F32(0.5)),
                FieldValue::Array(vec![Value::I16(-100), Value::I16(0), Value::I16(250)]),
                FieldValue::Scalar(Value::U32(3600)),
            ],
        )
        .unwrap()
        .encode()
    }

    fn opmode_frame(mode: u8, flags: u16) -> Vec<u8> {
        Message::new(
            &OPMODE_ADCS,
            vec![
                FieldValue::Scalar(Value::U8(mode)),
                FieldValue::Scalar(Value::U16(flags)),
            ],
        )
        .unwrap()
        .encode()
    }

    #[test]
    fn acknowledged_command_reply() {
        let (mut d, sim, _q) = dispatcher(vec![0, 1]);
        let outcome = d.handle_command("setOpmode 2\n");
        assert_eq!(outcome, CommandOutcome::Acknowledged("setOpmode"));
        assert_eq!(outcome.reply_text("ADCS"), "setOpmode message sent\n");
        assert_eq!(sim.sent_frames(), vec![vec![0, 2]]);
    }

    #[test]
    fn unacknowledged_command_reply() {
        let (mut d, sim, _q) = dispatcher(vec![0, 1]);
        sim.set_ack(AckBehavior::Never);
        let outcome = d.handle_command("setOpmode 2");
        assert_eq!(
            outcome.reply_text("ADCS"),
            "ERROR: ADCS did not acknowledge setOpmode\n"
        );
        assert_eq!(sim.send_attempts(), 3);
    }

    #[test]
    fn unknown_keyword_never_touches_link() {
        let (mut d, sim, _q) = dispatcher(vec![0, 1]);
        let reply = d.handle_command("fireThrusters 1").reply_text("ADCS");
        assert!(reply.starts_with("ERROR: "));
        assert!(reply.ends_with("You can list available commands with 'help'\n"));
        assert_eq!(sim.send_attempts(), 0);
    }

    #[test]
    fn empty_and_malformed_commands_are_rejected() {
        let (mut d, sim, _q) = dispatcher(vec![0, 1]);
        for text in ["", "   ", "setOpmode", "setOpmode x", "setAttitudeTarget 1 2"] {
            assert!(matches!(d.handle_command(text), CommandOutcome::Rejected(_)), "{text:?}");
        }
        assert_eq!(sim.send_attempts(), 0);
    }

    #[test]
    fn unavailable_command_is_rejected() {
        let (mut d, sim, _q) = dispatcher(vec![0]);
        assert_eq!(
            d.handle_command("setAttitudeTarget \"1 0 0 0\" 0.1"),
            CommandOutcome::Rejected(CodecError::Unavailable("setAttitudeTarget"))
        );
        assert_eq!(sim.send_attempts(), 0);
    }

    #[test]
    fn help_lists_available_commands_in_catalog_order() {
        let (mut d, sim, _q) = dispatcher(vec![1, 0]);
        let CommandOutcome::Help(text) = d.handle_command("help") else {
            panic!("expected help");
        };
        assert!(text.starts_with(HELP_HEADER));
        let set_opmode = text.find("setOpmode").unwrap();
        let set_target = text.find("setAttitudeTarget").unwrap();
        assert!(set_opmode < set_target);
        assert_eq!(text.matches("setOpmode").count(), 1);
        assert_eq!(text.matches("setAttitudeTarget").count(), 1);
        assert_eq!(text.matches("\n\n").count(), 2);
        assert_eq!(sim.send_attempts(), 0);

        let (only_opmode, _, _) = dispatcher(vec![0]);
        let text = only_opmode.help_text();
        assert_eq!(text, format!("{HELP_HEADER}{}\n\n", SET_OPMODE.describe()));
    }

    #[tokio::test]
    async fn telemetry_frames_are_published_in_order() {
        let (mut d, sim, queue) = dispatcher(vec![0, 1]);
        sim.push_inbound(opmode_frame(1, 0));
        sim.push_inbound(housekeeping_frame());
        sim.push_inbound(opmode_frame(2, 5));
        while d.poll_link() {}

        let expected = [
            format!("opmodeADCS,source=ADCS mode=1,faultFlags=0 {TS}\n"),
            format!(
                "housekeepingADCS,source=ADCS temperature=21.5,busVoltage=7.25,busCurrent=0.5,\
                 wheelSpeed[0]=-100,wheelSpeed[1]=0,wheelSpeed[2]=250,uptime=3600 {TS}\n"
            ),
            format!("opmodeADCS,source=ADCS mode=2,faultFlags=5 {TS}\n"),
        ];
        for line in expected {
            assert_eq!(queue.pop(WAIT).await, Some(line));
        }
        assert_eq!(queue.pop(WAIT).await, None);
    }

    #[tokio::test]
    async fn non_finite_telemetry_is_dropped() {
        let (mut d, sim, queue) = dispatcher(vec![0, 1]);
        let f = |v: &[f32]| FieldValue::Array(v.iter().copied().map(Value::F32).collect());
        let nan_attitude = Message::new(
            &ATTITUDE_ADCS,
            vec![f(&[1.0, 0.0, 0.0, 0.0]), f(&[0.0, 0.0, 0.0]), f(&[f32::NAN, 0.0, 0.0])],
        )
        .unwrap()
        .encode();
        sim.push_inbound(nan_attitude);
        sim.push_inbound(opmode_frame(1, 0));
        while d.poll_link() {}

        assert_eq!(
            queue.pop(WAIT).await,
            Some(format!("opmodeADCS,source=ADCS mode=1,faultFlags=0 {TS}\n"))
        );
        assert_eq!(queue.pop(WAIT).await, None);
    }

    #[tokio::test]
    async fn bad_frames_are_dropped_and_later_frames_still_flow() {
        let (mut d, sim, queue) = dispatcher(vec![0, 1]);
        sim.push_inbound(vec![99, 1, 2]);
        sim.push_inbound(vec![4, 1]);
        sim.push_inbound(vec![0, 3]);
        sim.push_inbound(opmode_frame(3, 1));
        while d.poll_link() {}

        assert_eq!(
            queue.pop(WAIT).await,
            Some(format!("opmodeADCS,source=ADCS mode=3,faultFlags=1 {TS}\n"))
        );
        assert_eq!(queue.pop(WAIT).await, None);
    }

    #[test]
    fn run_loop_answers_commands_and_stops_on_shutdown() {
        let (d, sim, _q) = dispatcher(vec![0, 1]);
        let (cmd_tx, cmd_rx) = mpsc::channel(4);
        let (reply_tx, mut reply_rx) = mpsc::channel(4);
        let signal = ShutdownSignal::new();
        let listener = signal.listener();
        let worker = std::thread::spawn(move || d.run(cmd_rx, reply_tx, listener, WAIT));

        cmd_tx.blocking_send("setOpmode 1".into()).unwrap();
        let reply = reply_rx.blocking_recv();
        assert_eq!(reply.as_deref(), Some("setOpmode message sent\n"));

        signal.trigger();
        worker.join().unwrap().unwrap();
        assert!(!sim.is_initialized());
    }

    #[test]
    fn run_loop_fails_when_gateway_disappears() {
        let (d, _sim, _q) = dispatcher(vec![0, 1]);
        let (cmd_tx, cmd_rx) = mpsc::channel::<String>(4);
        let (reply_tx, _reply_rx) = mpsc::channel(4);
        let signal = ShutdownSignal::new();
        drop(cmd_tx);
        assert!(d.run(cmd_rx, reply_tx, signal.listener(), WAIT).is_err());
    }
}
