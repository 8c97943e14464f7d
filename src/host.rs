use anyhow::{Context, Result, anyhow};
use log::{debug, error, info, warn};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::config::EmulatorConfig;
use crate::nes::Emulator;
use crate::nes::controller::Button;

#[derive(Debug, Default)]
struct Control {
    paused: bool,
    stopped: bool,
}

type Shared = Arc<(Mutex<Control>, Condvar)>;

/// Receiving ends of the host thread. Frames hold palette indices,
/// `FRAME_WIDTH * FRAME_HEIGHT` bytes each.
pub struct HostOutputs {
    pub frames: Receiver<Vec<u8>>,
    pub samples: Receiver<Vec<f32>>,
}

/// Runs an [`Emulator`] on its own thread, one frame per tick.
pub struct EmulatorHost {
    emulator: Arc<Mutex<Emulator>>,
    control: Shared,
    thread: Option<JoinHandle<()>>,
}

impl EmulatorHost {
    pub fn spawn(mut emulator: Emulator, config: &EmulatorConfig) -> Result<(Self, HostOutputs)> {
        if !emulator.has_cartridge() {
            return Err(anyhow!("cannot start host without a cartridge"));
        }

        let (frame_tx, frames) = mpsc::sync_channel(config.frame_queue_depth.max(1));
        let (sample_tx, samples) = mpsc::channel();
        emulator.set_frame_callback(frame_sink(frame_tx));
        emulator.set_sample_callback(sample_sink(sample_tx, config.sample_chunk.max(1)));

        let emulator = Arc::new(Mutex::new(emulator));
        let control: Shared = Arc::new((Mutex::new(Control::default()), Condvar::new()));

        let thread = {
            let emulator = Arc::clone(&emulator);
            let control = Arc::clone(&control);
            let period = config.frame_period();
            let pace = config.pace;
            thread::Builder::new()
                .name("famicore-host".into())
                .spawn(move || run(emulator, control, period, pace))
                .context("failed to spawn emulator thread")?
        };

        info!(
            "Host started ({:.3} Hz, pacing {})",
            config.frame_rate_hz,
            if config.pace { "on" } else { "off" }
        );
        Ok((
            Self {
                emulator,
                control,
                thread: Some(thread),
            },
            HostOutputs { frames, samples },
        ))
    }

    pub fn pause(&self) {
        self.control_mut(|control| control.paused = true);
        debug!("Host paused");
    }

    pub fn resume(&self) {
        self.control_mut(|control| control.paused = false);
        debug!("Host resumed");
    }

    pub fn is_paused(&self) -> bool {
        lock(&self.control.0).paused
    }

    pub fn set_button(&self, button: Button, pressed: bool) {
        lock(&self.emulator).set_button(button, pressed);
    }

    pub fn set_controller_state(&self, buttons: u8) {
        lock(&self.emulator).set_controller_state(buttons);
    }

    pub fn frame_count(&self) -> u64 {
        lock(&self.emulator).frame_count()
    }

    /// Snapshot taken between frames.
    pub fn save_state(&self) -> Result<Vec<u8>> {
        Ok(self.while_paused(|emulator| emulator.save_state())?)
    }

    pub fn load_state(&self, data: &[u8]) -> Result<()> {
        Ok(self.while_paused(|emulator| emulator.load_state(data))?)
    }

    /// Holds the thread between frames for the duration of `f`, then puts
    /// the previous run state back.
    fn while_paused<T>(&self, f: impl FnOnce(&mut Emulator) -> T) -> T {
        let was_paused = self.is_paused();
        self.control_mut(|control| control.paused = true);
        let result = f(&mut lock(&self.emulator));
        if !was_paused {
            self.control_mut(|control| control.paused = false);
        }
        result
    }

    /// Runs `f` with exclusive access to the core, between frames.
    pub fn with_emulator<T>(&self, f: impl FnOnce(&mut Emulator) -> T) -> T {
        f(&mut lock(&self.emulator))
    }

    /// Stops the thread and hands the emulator back.
    pub fn stop(mut self) -> Result<Emulator> {
        self.shutdown();
        let emulator = Arc::clone(&self.emulator);
        drop(self);
        let emulator = Arc::try_unwrap(emulator)
            .map_err(|_| anyhow!("emulator is still shared"))?
            .into_inner()
            .map_err(|_| anyhow!("emulator lock poisoned"))?;
        Ok(emulator)
    }

    fn control_mut(&self, f: impl FnOnce(&mut Control)) {
        let (mutex, condvar) = &*self.control;
        f(&mut lock(mutex));
        condvar.notify_all();
    }

    fn shutdown(&mut self) {
        self.control_mut(|control| control.stopped = true);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Emulator thread panicked");
            }
        }
    }
}

impl Drop for EmulatorHost {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn frame_sink(tx: SyncSender<Vec<u8>>) -> impl FnMut(&[u8]) + Send + 'static {
    let mut dropped = 0u64;
    move |buffer| match tx.try_send(buffer.to_vec()) {
        Ok(()) => {}
        Err(TrySendError::Full(_)) => {
            dropped += 1;
            if dropped.is_power_of_two() {
                warn!("Frame queue full, {dropped} frames dropped so far");
            }
        }
        Err(TrySendError::Disconnected(_)) => {}
    }
}

fn sample_sink(tx: mpsc::Sender<Vec<f32>>, chunk: usize) -> impl FnMut(f32) + Send + 'static {
    let mut pending = Vec::with_capacity(chunk);
    move |sample| {
        pending.push(sample);
        if pending.len() >= chunk {
            let full = std::mem::replace(&mut pending, Vec::with_capacity(chunk));
            let _ = tx.send(full);
        }
    }
}

fn run(emulator: Arc<Mutex<Emulator>>, control: Shared, period: Duration, pace: bool) {
    let (control_lock, condvar) = &*control;
    let mut next = Instant::now();

    loop {
        {
            let mut state = lock(control_lock);
            while state.paused && !state.stopped {
                state = condvar
                    .wait(state)
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                next = Instant::now();
            }
            if state.stopped {
                break;
            }
        }

        if let Err(err) = lock(&emulator).step_frame() {
            error!("Emulator thread stopping: {err}");
            break;
        }

        if !pace {
            continue;
        }
        next += period;
        let now = Instant::now();
        if now > next + period {
            // More than a frame behind: drop the backlog.
            next = now;
            continue;
        }
        let wait = next.saturating_duration_since(now);
        if !wait.is_zero() {
            let state = lock(control_lock);
            if !state.stopped {
                let _ = condvar.wait_timeout(state, wait);
            }
        }
    }
    debug!("Emulator thread exited");
}
