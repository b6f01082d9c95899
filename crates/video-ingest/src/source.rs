//! Threaded frame source holding exactly one latest frame.
//!
//! Acquisition runs on its own thread and overwrites a single slot; the
//! control loop copies the slot out without ever waiting for a new frame.
//! Shutdown joins the acquisition thread first and only then releases the
//! device, which the thread hands back through its join handle.

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use tracing::{debug, error, info, warn};

use crate::{
    device::CaptureDevice,
    types::{CaptureError, Frame},
};

/// Consecutive failed reads tolerated before the source gives up.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 30;

#[derive(Clone, Copy, Debug)]
pub struct CaptureOptions {
    /// Target acquisition rate; the thread sleeps `1 / fps` between reads.
    pub fps: f64,
    pub failure_threshold: u32,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            fps: 30.0,
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
        }
    }
}

impl CaptureOptions {
    fn frame_interval(&self) -> Duration {
        if self.fps > 0.0 {
            Duration::from_secs_f64(1.0 / self.fps)
        } else {
            Duration::ZERO
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceStatus {
    Idle,
    Running,
    /// Terminal: the failure threshold was reached and capture stopped.
    Failed,
    Stopped,
}

type Slot = Arc<Mutex<Option<Frame>>>;

pub struct FrameSource<D: CaptureDevice> {
    device: Option<D>,
    options: CaptureOptions,
    slot: Slot,
    status: Arc<Mutex<SourceStatus>>,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<D>>,
}

impl<D: CaptureDevice> FrameSource<D> {
    pub fn new(device: D, options: CaptureOptions) -> Self {
        Self {
            device: Some(device),
            options,
            slot: Arc::new(Mutex::new(None)),
            status: Arc::new(Mutex::new(SourceStatus::Idle)),
            running: Arc::new(AtomicBool::new(false)),
            handle: None,
        }
    }

    /// Begin background acquisition. Calling `start` on a running source is a no-op.
    pub fn start(&mut self) -> Result<(), CaptureError> {
        if self.handle.is_some() {
            debug!("frame source already running");
            return Ok(());
        }
        let device = self.device.take().ok_or(CaptureError::Released)?;
        info!("starting capture from {}", device.describe());

        self.running.store(true, Ordering::SeqCst);
        set_status(&self.status, SourceStatus::Running);

        let slot = self.slot.clone();
        let status = self.status.clone();
        let running = self.running.clone();
        let options = self.options;
        let handle = thread::Builder::new()
            .name("frame-source".into())
            .spawn(move || acquisition_loop(device, options, slot, status, running))
            .map_err(|err| CaptureError::Other(err.into()))?;
        self.handle = Some(handle);
        Ok(())
    }

    /// Copy of the most recent frame, or `None` when nothing has been captured yet.
    pub fn get_frame(&self) -> Option<Frame> {
        match self.slot.lock() {
            Ok(guard) => guard.clone(),
            Err(_) => None,
        }
    }

    pub fn status(&self) -> SourceStatus {
        match self.status.lock() {
            Ok(guard) => *guard,
            Err(_) => SourceStatus::Failed,
        }
    }

    /// Stop acquisition, join the thread, then release the device.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);

        if let Some(handle) = self.handle.take() {
            match handle.join() {
                Ok(device) => self.device = Some(device),
                Err(_) => error!("frame source thread panicked; device handle lost"),
            }
        }
        if let Some(mut device) = self.device.take() {
            device.release();
            info!("released {}", device.describe());
        }

        if self.status() != SourceStatus::Failed {
            set_status(&self.status, SourceStatus::Stopped);
        }
    }
}

impl<D: CaptureDevice> Drop for FrameSource<D> {
    fn drop(&mut self) {
        self.stop();
    }
}

fn set_status(status: &Mutex<SourceStatus>, value: SourceStatus) {
    if let Ok(mut guard) = status.lock() {
        *guard = value;
    }
}

fn acquisition_loop<D: CaptureDevice>(
    mut device: D,
    options: CaptureOptions,
    slot: Slot,
    status: Arc<Mutex<SourceStatus>>,
    running: Arc<AtomicBool>,
) -> D {
    let interval = options.frame_interval();
    let mut failures: u32 = 0;
    let mut sequence: u64 = 0;

    while running.load(Ordering::Relaxed) {
        match device.read_frame() {
            Ok(Some(mut frame)) => {
                failures = 0;
                sequence = sequence.wrapping_add(1);
                frame.sequence = sequence;
                if let Ok(mut guard) = slot.lock() {
                    *guard = Some(frame);
                }
            }
            Ok(None) => {
                failures += 1;
                debug!("missed frame ({failures} consecutive)");
            }
            Err(err) => {
                failures += 1;
                warn!("capture read failed ({failures} consecutive): {err}");
            }
        }

        if failures >= options.failure_threshold {
            let err = CaptureError::ConsecutiveFailures { count: failures };
            error!("{}: {err}; capture stopped", device.describe());
            set_status(&status, SourceStatus::Failed);
            running.store(false, Ordering::SeqCst);
            break;
        }

        if !interval.is_zero() {
            thread::sleep(interval);
        }
    }

    device
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::AtomicUsize,
        time::{Duration, Instant},
    };

    use super::*;
    use crate::types::FrameFormat;

    struct ScriptedDevice {
        fail: bool,
        released: Arc<AtomicBool>,
        reads: Arc<AtomicUsize>,
    }

    impl CaptureDevice for ScriptedDevice {
        fn read_frame(&mut self) -> Result<Option<Frame>, CaptureError> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Ok(None);
            }
            Ok(Some(Frame {
                data: vec![7; 12],
                width: 2,
                height: 2,
                timestamp_ms: 1_000,
                sequence: 0,
                format: FrameFormat::Bgr8,
            }))
        }

        fn release(&mut self) {
            self.released.store(true, Ordering::SeqCst);
        }

        fn describe(&self) -> String {
            "scripted".into()
        }
    }

    fn scripted(fail: bool) -> (ScriptedDevice, Arc<AtomicBool>, Arc<AtomicUsize>) {
        let released = Arc::new(AtomicBool::new(false));
        let reads = Arc::new(AtomicUsize::new(0));
        (
            ScriptedDevice {
                fail,
                released: released.clone(),
                reads: reads.clone(),
            },
            released,
            reads,
        )
    }

    fn fast() -> CaptureOptions {
        CaptureOptions {
            fps: 500.0,
            failure_threshold: 5,
        }
    }

    fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        cond()
    }

    #[test]
    fn get_frame_is_none_before_start() {
        let (device, _, _) = scripted(false);
        let source = FrameSource::new(device, fast());
        assert!(source.get_frame().is_none());
        assert_eq!(source.status(), SourceStatus::Idle);
    }

    #[test]
    fn returns_copies_of_latest_frame() {
        let (device, _, _) = scripted(false);
        let mut source = FrameSource::new(device, fast());
        source.start().unwrap();

        assert!(wait_until(|| source.get_frame().is_some()));
        let mut first = source.get_frame().unwrap();
        first.data[0] = 0;
        let second = source.get_frame().unwrap();
        assert_eq!(second.data[0], 7);
        assert!(second.sequence >= 1);
        source.stop();
    }

    #[test]
    fn stop_joins_before_release() {
        let (device, released, reads) = scripted(false);
        let mut source = FrameSource::new(device, fast());
        source.start().unwrap();
        assert!(wait_until(|| reads.load(Ordering::SeqCst) > 2));

        source.stop();
        assert!(released.load(Ordering::SeqCst));
        let after_stop = reads.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(reads.load(Ordering::SeqCst), after_stop);
        assert_eq!(source.status(), SourceStatus::Stopped);
    }

    #[test]
    fn consecutive_failures_are_terminal() {
        let (device, released, reads) = scripted(true);
        let mut source = FrameSource::new(device, fast());
        source.start().unwrap();

        assert!(wait_until(|| source.status() == SourceStatus::Failed));
        thread::sleep(Duration::from_millis(20));
        assert_eq!(reads.load(Ordering::SeqCst), 5);
        assert!(source.get_frame().is_none());

        source.stop();
        assert!(released.load(Ordering::SeqCst));
        assert_eq!(source.status(), SourceStatus::Failed);
    }

    #[test]
    fn start_twice_is_noop_and_restart_after_stop_fails() {
        let (device, _, _) = scripted(false);
        let mut source = FrameSource::new(device, fast());
        source.start().unwrap();
        source.start().unwrap();
        source.stop();
        assert!(matches!(source.start(), Err(CaptureError::Released)));
    }
}
