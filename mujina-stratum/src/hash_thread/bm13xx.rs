//! BM13xx HashThread.
//!
//! Drives a chain of BM1370 chips behind one serial port. The chips take full
//! block headers and search the nonce and version space themselves, so the
//! host only picks extranonce2 values. Every [`JOB_INTERVAL`] the thread moves
//! to the next extranonce2 in its range and sends a fresh job.
//!
//! Chips know jobs only by a 4-bit id. A [`JobTracker`] remembers which
//! assignment and extranonce2 each id was sent for, so nonce responses can be
//! turned back into candidates.

use std::io;
use std::pin::Pin;

use async_trait::async_trait;
use bitcoin::block::Version;
use bitcoin::hashes::Hash;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::time::{self, Duration, Instant};
use tokio_serial::SerialPortBuilderExt;
use tokio_util::codec::Framed;

use super::{Candidate, HashThread, HashThreadError, Status, WorkAssignment};
use crate::chip::bm13xx::{
    Command, FrameCodec, JobFrame, Register, RegisterAddress, Response, BM1370_CHIP_ID,
};
use crate::tracing::{prelude::*, LogConfig};
use crate::types::{Extranonce2, Extranonce2Iter, HashRate};

pub const BAUD_RATE: u32 = 115_200;

/// How long one poll waits for responses.
const READ_TIMEOUT: Duration = Duration::from_millis(50);

/// How long chips get to answer the chip id broadcast.
const DETECT_TIMEOUT: Duration = Duration::from_millis(500);

/// How long a chip works on one extranonce2 before it gets the next.
pub const JOB_INTERVAL: Duration = Duration::from_secs(2);

/// Chip-level difficulty programmed into the ticket mask.
pub const DEFAULT_CHIP_DIFFICULTY: u32 = 256;

/// Version bits the chips roll start here.
const VERSION_SHIFT: u32 = 13;

const JOB_SLOTS: usize = 16;

const CORE_REGISTER_INIT: u32 = 0x008b_0080;
const INIT_CONTROL_INIT: u32 = 0x0000_0700;
const MISC_CONTROL_INIT: u32 = 0x00c1_00f0;

pub type FrameStream = Pin<Box<dyn Stream<Item = io::Result<Response>> + Send>>;
pub type FrameSink = Pin<Box<dyn Sink<Command, Error = io::Error> + Send>>;

/// Something that can produce a framed connection to a chip chain.
pub trait Port: Send {
    fn name(&self) -> &str;

    fn open(&mut self) -> Result<(FrameStream, FrameSink), HashThreadError>;
}

/// A chip chain on a serial device.
pub struct SerialPort {
    path: String,
    log: LogConfig,
}

impl SerialPort {
    pub fn new(path: impl Into<String>, log: LogConfig) -> Self {
        Self {
            path: path.into(),
            log,
        }
    }
}

impl Port for SerialPort {
    fn name(&self) -> &str {
        &self.path
    }

    fn open(&mut self) -> Result<(FrameStream, FrameSink), HashThreadError> {
        let port = tokio_serial::new(&self.path, BAUD_RATE)
            .open_native_async()
            .map_err(|e| match e.kind {
                tokio_serial::ErrorKind::NoDevice
                | tokio_serial::ErrorKind::Io(io::ErrorKind::NotFound) => {
                    HashThreadError::DeviceNotFound(format!("{}: {}", self.path, e))
                }
                _ => HashThreadError::Communication(format!("{}: {}", self.path, e)),
            })?;

        let (sink, stream) = Framed::new(port, FrameCodec::new(self.log)).split();
        Ok((Box::pin(stream), Box::pin(sink)))
    }
}

/// What a chip job id was sent for.
#[derive(Debug, Clone)]
struct ChipJob {
    work: WorkAssignment,
    en2: Extranonce2,
}

/// Maps the 4-bit chip job ids to the work they were sent for.
///
/// Ids are handed out round-robin, so a slot is only reused after fifteen
/// newer jobs.
#[derive(Debug, Default)]
struct JobTracker {
    slots: [Option<ChipJob>; JOB_SLOTS],
    next: u8,
}

impl JobTracker {
    fn insert(&mut self, job: ChipJob) -> u8 {
        let id = self.next;
        self.slots[id as usize] = Some(job);
        self.next = (id + 1) % JOB_SLOTS as u8;
        id
    }

    fn get(&self, id: u8) -> Option<&ChipJob> {
        self.slots.get(id as usize)?.as_ref()
    }

    fn clear(&mut self) {
        self.slots = Default::default();
    }
}

/// Current assignment and where we are in its extranonce2 range.
struct Current {
    work: WorkAssignment,
    en2_iter: Extranonce2Iter,
    sent_at: Instant,
}

#[derive(Debug, Default)]
struct Counters {
    nonces: u64,
    candidates: u64,
    hardware_errors: u64,
}

pub struct Bm13xxThread {
    name: String,
    port: Box<dyn Port>,
    chip_difficulty: u32,
    reader: Option<FrameStream>,
    writer: Option<FrameSink>,
    chips: usize,
    chip_version_mask: Option<u16>,
    tracker: JobTracker,
    current: Option<Current>,
    counters: Counters,
    started_at: Option<Instant>,
}

impl Bm13xxThread {
    pub fn new(name: impl Into<String>, port: Box<dyn Port>, chip_difficulty: u32) -> Self {
        Self {
            name: name.into(),
            port,
            chip_difficulty,
            reader: None,
            writer: None,
            chips: 0,
            chip_version_mask: None,
            tracker: JobTracker::default(),
            current: None,
            counters: Counters::default(),
            started_at: None,
        }
    }

    /// A thread for the chips on a serial device.
    pub fn serial(path: &str, log: LogConfig) -> Self {
        Self::new(
            format!("bm1370@{path}"),
            Box::new(SerialPort::new(path, log)),
            DEFAULT_CHIP_DIFFICULTY,
        )
    }

    async fn send(&mut self, command: Command) -> Result<(), HashThreadError> {
        self.writer
            .as_mut()
            .ok_or(HashThreadError::NotStarted)?
            .send(command)
            .await
            .map_err(|e| HashThreadError::Communication(e.to_string()))
    }

    async fn broadcast(&mut self, register: Register) -> Result<(), HashThreadError> {
        self.send(Command::WriteRegister {
            all: true,
            address: 0,
            register,
        })
        .await
    }

    /// Count the chips answering a chip id read.
    async fn detect_chips(&mut self) -> Result<usize, HashThreadError> {
        self.send(Command::ReadRegister {
            all: true,
            address: 0,
            register: RegisterAddress::ChipId,
        })
        .await?;

        let reader = self.reader.as_mut().ok_or(HashThreadError::NotStarted)?;
        let deadline = Instant::now() + DETECT_TIMEOUT;
        let mut chips = 0;
        loop {
            match time::timeout_at(deadline, reader.next()).await {
                Err(_) => break,
                Ok(None) => {
                    return Err(HashThreadError::Communication("serial port closed".into()))
                }
                Ok(Some(Err(e))) => return Err(HashThreadError::Communication(e.to_string())),
                Ok(Some(Ok(response))) => match response.chip_id() {
                    Some(BM1370_CHIP_ID) => chips += 1,
                    Some(other) => {
                        warn!(thread = %self.name, chip_id = %hex::encode(other), "Unsupported chip")
                    }
                    None => trace!(thread = %self.name, ?response, "Ignoring response"),
                },
            }
        }
        Ok(chips)
    }

    async fn init_chips(&mut self) -> Result<(), HashThreadError> {
        self.broadcast(Register::VersionMask { mask: 0 }).await?;
        self.chip_version_mask = Some(0);

        let chips = self.detect_chips().await?;
        if chips == 0 {
            return Err(HashThreadError::Communication(format!(
                "no chips answered on {}",
                self.port.name()
            )));
        }

        self.send(Command::ChainInactive).await?;
        let spacing = (256 / chips).max(1);
        for i in 0..chips {
            let address = (i * spacing) as u8;
            self.send(Command::SetChipAddress { address }).await?;
        }

        self.broadcast(Register::CoreRegister(CORE_REGISTER_INIT)).await?;
        self.broadcast(Register::InitControl(INIT_CONTROL_INIT)).await?;
        self.broadcast(Register::MiscControl(MISC_CONTROL_INIT)).await?;
        self.broadcast(Register::ticket_mask(self.chip_difficulty))
            .await?;

        self.chips = chips;
        info!(thread = %self.name, chips, difficulty = self.chip_difficulty, "Chips initialized");
        Ok(())
    }

    /// Point the chips' version rolling at the job's mask.
    async fn set_version_mask(&mut self, job_mask: Option<u32>) -> Result<(), HashThreadError> {
        let mask = (job_mask.unwrap_or(0) >> VERSION_SHIFT) as u16;
        if self.chip_version_mask != Some(mask) {
            self.broadcast(Register::VersionMask { mask }).await?;
            self.chip_version_mask = Some(mask);
        }
        Ok(())
    }

    /// Send the next extranonce2 of the current assignment as a chip job.
    async fn send_next_job(&mut self) -> Result<(), HashThreadError> {
        let frame = {
            let Some(current) = self.current.as_mut() else {
                return Ok(());
            };
            let en2 = match current.en2_iter.next() {
                Some(en2) => en2,
                None => {
                    current.en2_iter = current.work.en2_range.iter();
                    current.en2_iter.next().ok_or_else(|| {
                        HashThreadError::InvalidAssignment("empty extranonce2 range".into())
                    })?
                }
            };
            current.sent_at = Instant::now();

            let job = &current.work.job;
            let merkle_root = job
                .merkle_root(&en2)
                .map_err(|e| HashThreadError::InvalidAssignment(e.to_string()))?;
            let frame = JobFrame {
                job_id: 0,
                starting_nonce: 0,
                nbits: job.bits.to_consensus(),
                ntime: job.time,
                merkle_root: merkle_root.to_byte_array(),
                prev_block_hash: job.prev_blockhash.to_byte_array(),
                version: job.version.to_consensus() as u32,
            };
            let job_id = self.tracker.insert(ChipJob {
                work: current.work.clone(),
                en2,
            });
            JobFrame { job_id, ..frame }
        };

        trace!(thread = %self.name, chip_job = frame.job_id, "Sending job");
        self.send(Command::Job(frame)).await
    }

    fn on_response(&mut self, response: Response) -> Option<Candidate> {
        let Response::Nonce {
            nonce,
            job_id,
            version_bits,
            subcore,
            ..
        } = response
        else {
            trace!(thread = %self.name, ?response, "Ignoring response");
            return None;
        };

        self.counters.nonces += 1;
        let Some(chip_job) = self.tracker.get(job_id) else {
            self.counters.hardware_errors += 1;
            debug!(thread = %self.name, job_id, "Nonce for unknown chip job");
            return None;
        };

        let job = &chip_job.work.job;
        let mask = job.version_mask.unwrap_or(0);
        let base = job.version.to_consensus() as u32;
        let rolled = (base & !mask) | ((u32::from(version_bits) << VERSION_SHIFT) & mask);
        let version = Version::from_consensus(rolled as i32);

        debug!(
            thread = %self.name,
            job = %job.id,
            nonce = %format!("{nonce:#010x}"),
            subcore,
            "Nonce from chip"
        );
        self.counters.candidates += 1;
        Some(Candidate::for_job(
            job,
            chip_job.en2,
            job.time,
            nonce,
            version,
        ))
    }

    fn estimated_hash_rate(&self) -> HashRate {
        // Each nonce a chip reports stands for chip_difficulty * 2^32 hashes.
        let Some(started_at) = self.started_at else {
            return HashRate::default();
        };
        let hashes =
            self.counters.nonces as f64 * f64::from(self.chip_difficulty) * 4_294_967_296.0;
        HashRate::from_hashes(hashes, started_at.elapsed())
    }
}

#[async_trait]
impl HashThread for Bm13xxThread {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&mut self) -> Result<(), HashThreadError> {
        let (reader, writer) = self.port.open()?;
        self.reader = Some(reader);
        self.writer = Some(writer);
        self.tracker.clear();
        self.current = None;

        if let Err(e) = self.init_chips().await {
            self.reader = None;
            self.writer = None;
            return Err(e);
        }
        self.started_at = Some(Instant::now());
        self.counters = Counters::default();
        Ok(())
    }

    async fn assign(&mut self, work: Option<WorkAssignment>) -> Result<(), HashThreadError> {
        let Some(work) = work else {
            // Chips finish what they have; the results are dropped.
            self.tracker.clear();
            self.current = None;
            return Ok(());
        };

        if let Some(current) = self.current.as_mut() {
            if current.work.same_search_space(&work) {
                current.work.target = work.target;
                return Ok(());
            }
        }

        self.set_version_mask(work.job.version_mask).await?;
        self.current = Some(Current {
            en2_iter: work.en2_range.iter(),
            work,
            sent_at: Instant::now(),
        });
        self.send_next_job().await
    }

    async fn poll(&mut self) -> Result<Vec<Candidate>, HashThreadError> {
        let reader = self.reader.as_mut().ok_or(HashThreadError::NotStarted)?;
        let deadline = Instant::now() + READ_TIMEOUT;
        let mut responses = Vec::new();
        loop {
            match time::timeout_at(deadline, reader.next()).await {
                Err(_) => break,
                Ok(None) => {
                    return Err(HashThreadError::Communication("serial port closed".into()))
                }
                Ok(Some(Err(e))) => return Err(HashThreadError::Communication(e.to_string())),
                Ok(Some(Ok(response))) => responses.push(response),
            }
        }

        let found: Vec<Candidate> = responses
            .into_iter()
            .filter_map(|response| self.on_response(response))
            .collect();

        let due = self
            .current
            .as_ref()
            .is_some_and(|current| current.sent_at.elapsed() >= JOB_INTERVAL);
        if due {
            self.send_next_job().await?;
        }

        Ok(found)
    }

    async fn stop(&mut self) -> Result<(), HashThreadError> {
        self.current = None;
        self.tracker.clear();
        self.reader = None;
        if let Some(mut writer) = self.writer.take() {
            writer
                .close()
                .await
                .map_err(|e| HashThreadError::Communication(e.to_string()))?;
        }
        Ok(())
    }

    fn status(&self) -> Status {
        Status {
            hash_rate: self.estimated_hash_rate(),
            candidates: self.counters.candidates,
            hardware_errors: self.counters.hardware_errors,
            temperature_c: None,
            active: self.current.is_some(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Arc;

    use bitcoin::pow::Target;
    use futures::channel::mpsc as futures_mpsc;
    use futures::FutureExt;
    use tokio::sync::mpsc;
    use tokio_stream::wrappers::ReceiverStream;

    use super::*;
    use crate::job_source::test_data::genesis;
    use crate::job_source::JobOrigin;
    use crate::types::Extranonce2Range;

    struct MockPort {
        opens: VecDeque<Result<(FrameStream, FrameSink), HashThreadError>>,
    }

    impl Port for MockPort {
        fn name(&self) -> &str {
            "mock"
        }

        fn open(&mut self) -> Result<(FrameStream, FrameSink), HashThreadError> {
            self.opens
                .pop_front()
                .unwrap_or_else(|| Err(HashThreadError::DeviceNotFound("mock".into())))
        }
    }

    /// Test side of a mock serial connection.
    struct Chip {
        responses: mpsc::Sender<io::Result<Response>>,
        commands: futures_mpsc::UnboundedReceiver<Command>,
    }

    impl Chip {
        fn written(&mut self) -> Vec<Command> {
            let mut out = Vec::new();
            while let Some(Some(command)) = self.commands.next().now_or_never() {
                out.push(command);
            }
            out
        }

        async fn respond(&self, response: Response) {
            self.responses.send(Ok(response)).await.unwrap();
        }
    }

    fn wire() -> ((FrameStream, FrameSink), Chip) {
        let (responses, response_rx) = mpsc::channel(16);
        let (command_tx, commands) = futures_mpsc::unbounded();
        let stream: FrameStream = Box::pin(ReceiverStream::new(response_rx));
        let sink: FrameSink = Box::pin(
            command_tx.sink_map_err(|e| io::Error::new(io::ErrorKind::BrokenPipe, e)),
        );
        ((stream, sink), Chip { responses, commands })
    }

    fn chip_id_response() -> Response {
        Response::RegisterValue {
            value: [0x13, 0x70, 0x00, 0x00],
            chip_address: 0,
            register: 0,
        }
    }

    fn nonce(nonce: u32, job_id: u8, version_bits: u16) -> Response {
        Response::Nonce {
            nonce,
            midstate: 0,
            job_id,
            subcore: 0,
            version_bits,
        }
    }

    fn genesis_work(job: crate::job_source::Job) -> WorkAssignment {
        let en2 = genesis::extranonce2();
        let range = Extranonce2Range::new_range(en2.value(), en2.value() + 9, 4).unwrap();
        WorkAssignment::new(Arc::new(job), range, Target::MAX).unwrap()
    }

    async fn started() -> (Bm13xxThread, Chip) {
        let (io, mut chip) = wire();
        let port = MockPort {
            opens: VecDeque::from([Ok(io)]),
        };
        chip.respond(chip_id_response()).await;
        let mut thread = Bm13xxThread::new("bm1370-test", Box::new(port), 256);
        thread.start().await.unwrap();
        chip.written();
        (thread, chip)
    }

    #[test]
    fn tracker_hands_out_ids_round_robin() {
        let job = genesis::job("g", JobOrigin::Dummy);
        let work = genesis_work(job);
        let mut tracker = JobTracker::default();
        let ids: Vec<u8> = (0..17)
            .map(|_| {
                tracker.insert(ChipJob {
                    work: work.clone(),
                    en2: genesis::extranonce2(),
                })
            })
            .collect();
        assert_eq!(ids[0], 0);
        assert_eq!(ids[15], 15);
        assert_eq!(ids[16], 0);
        assert!(tracker.get(3).is_some());

        tracker.clear();
        assert!(tracker.get(3).is_none());
        assert!(tracker.get(200).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn start_runs_init_sequence() {
        let (io, mut chip) = wire();
        chip.respond(chip_id_response()).await;
        let port = MockPort {
            opens: VecDeque::from([Ok(io)]),
        };
        let mut thread = Bm13xxThread::new("bm1370-test", Box::new(port), 256);
        thread.start().await.unwrap();

        let written = chip.written();
        assert_eq!(
            written.first(),
            Some(&Command::WriteRegister {
                all: true,
                address: 0,
                register: Register::VersionMask { mask: 0 },
            })
        );
        assert!(written.contains(&Command::ChainInactive));
        assert!(written.contains(&Command::SetChipAddress { address: 0 }));
        assert_eq!(
            written.last(),
            Some(&Command::WriteRegister {
                all: true,
                address: 0,
                register: Register::ticket_mask(256),
            })
        );
        assert_eq!(thread.chips, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_chain_is_a_communication_error() {
        let (io, _chip) = wire();
        let port = MockPort {
            opens: VecDeque::from([Ok(io)]),
        };
        let mut thread = Bm13xxThread::new("bm1370-test", Box::new(port), 256);
        let err = thread.start().await.unwrap_err();
        assert!(matches!(err, HashThreadError::Communication(_)));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn missing_port_is_device_not_found() {
        let port = MockPort {
            opens: VecDeque::new(),
        };
        let mut thread = Bm13xxThread::new("bm1370-test", Box::new(port), 256);
        assert!(matches!(
            thread.start().await,
            Err(HashThreadError::DeviceNotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn assignment_becomes_job_frame() {
        let (mut thread, mut chip) = started().await;
        let job = genesis::job("g", JobOrigin::Dummy);
        thread.assign(Some(genesis_work(job))).await.unwrap();

        let written = chip.written();
        assert_eq!(written.len(), 1);
        let Command::Job(frame) = &written[0] else {
            panic!("expected job, got {:?}", written[0]);
        };
        assert_eq!(frame.job_id, 0);
        assert_eq!(frame.ntime, genesis::TIME);
        assert_eq!(frame.nbits, genesis::BITS);
        assert_eq!(frame.version, 1);
        assert_eq!(frame.merkle_root, genesis::merkle_root().to_byte_array());
        assert_eq!(frame.prev_block_hash, [0; 32]);
        assert!(thread.status().active);
    }

    #[tokio::test(start_paused = true)]
    async fn nonce_response_becomes_candidate() {
        let (mut thread, chip) = started().await;
        let job = genesis::job("g", JobOrigin::Dummy);
        thread.assign(Some(genesis_work(job.clone()))).await.unwrap();

        chip.respond(nonce(genesis::NONCE, 0, 0)).await;
        let found = thread.poll().await.unwrap();

        assert_eq!(found.len(), 1);
        assert_eq!(found[0].nonce, genesis::NONCE);
        assert_eq!(found[0].extranonce2, genesis::extranonce2());
        let hash = job
            .block_hash(&found[0].extranonce2, found[0].ntime, found[0].version, found[0].nonce)
            .unwrap();
        assert_eq!(hash.to_string(), genesis::BLOCK_HASH_DISPLAY);
        assert_eq!(thread.status().candidates, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rolled_version_stays_within_mask() {
        let (mut thread, mut chip) = started().await;
        let mut job = genesis::job("g", JobOrigin::Pool { session: 1 });
        job.version = Version::from_consensus(0x2000_0000);
        job.version_mask = Some(0x1fff_e000);
        thread.assign(Some(genesis_work(job))).await.unwrap();

        let written = chip.written();
        assert_eq!(
            written[0],
            Command::WriteRegister {
                all: true,
                address: 0,
                register: Register::VersionMask { mask: 0xffff },
            }
        );

        chip.respond(nonce(1, 0, 0x0003)).await;
        let found = thread.poll().await.unwrap();
        assert_eq!(found[0].version, Version::from_consensus(0x2000_6000));
    }

    #[tokio::test(start_paused = true)]
    async fn chip_bits_replace_base_bits_inside_mask() {
        let (mut thread, chip) = started().await;
        let mut job = genesis::job("g", JobOrigin::Pool { session: 1 });
        job.version = Version::from_consensus(0x2000_6000);
        job.version_mask = Some(0x1fff_e000);
        thread.assign(Some(genesis_work(job))).await.unwrap();

        chip.respond(nonce(1, 0, 0x0001)).await;
        let found = thread.poll().await.unwrap();
        assert_eq!(found[0].version, Version::from_consensus(0x2000_2000));
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_chip_job_counts_as_hardware_error() {
        let (mut thread, chip) = started().await;
        let job = genesis::job("g", JobOrigin::Dummy);
        thread.assign(Some(genesis_work(job))).await.unwrap();

        chip.respond(nonce(1, 7, 0)).await;
        assert!(thread.poll().await.unwrap().is_empty());
        assert_eq!(thread.status().hardware_errors, 1);

        // Idle drops what the chips were working on
        thread.assign(None).await.unwrap();
        chip.respond(nonce(2, 0, 0)).await;
        assert!(thread.poll().await.unwrap().is_empty());
        assert_eq!(thread.status().hardware_errors, 2);
        assert!(!thread.status().active);
    }

    #[tokio::test(start_paused = true)]
    async fn retarget_does_not_resend_job() {
        let (mut thread, mut chip) = started().await;
        let job = genesis::job("g", JobOrigin::Dummy);
        let work = genesis_work(job);
        thread.assign(Some(work.clone())).await.unwrap();
        chip.written();

        let mut easier = work.clone();
        easier.target = Target::from_le_bytes([0xff; 32]);
        thread.assign(Some(easier)).await.unwrap();
        assert!(chip.written().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn moves_to_next_extranonce2_periodically() {
        let (mut thread, mut chip) = started().await;
        let job = genesis::job("g", JobOrigin::Dummy);
        thread.assign(Some(genesis_work(job))).await.unwrap();
        chip.written();

        time::advance(JOB_INTERVAL).await;
        thread.poll().await.unwrap();

        let written = chip.written();
        assert_eq!(written.len(), 1);
        let Command::Job(frame) = &written[0] else {
            panic!("expected job, got {:?}", written[0]);
        };
        assert_eq!(frame.job_id, 1);
        assert_ne!(frame.merkle_root, genesis::merkle_root().to_byte_array());
    }

    #[tokio::test(start_paused = true)]
    async fn closed_port_is_a_communication_error() {
        let (mut thread, chip) = started().await;
        drop(chip);
        assert!(matches!(
            thread.poll().await,
            Err(HashThreadError::Communication(_))
        ));
    }
}
