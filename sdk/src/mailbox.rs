use std::sync::atomic::Ordering;

use crate::error::RegionError;
use crate::layout::{OFFSET_INPUT, OFFSET_OUTPUT, SIZE_INPUT, SIZE_OUTPUT};
use crate::shm::SharedRegion;
use crate::task::TaskCode;

const SPIN_LIMIT: u32 = 4096;

/// Client end of the mailbox: one producer for the input region and for
/// every worker's flag word.
#[derive(Clone)]
pub struct Mailbox {
    region: SharedRegion,
    workers: usize,
}

impl Mailbox {
    pub fn new(region: SharedRegion, workers: usize) -> Self {
        Self { region, workers }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn set_workers(&mut self, workers: usize) {
        self.workers = workers;
    }

    pub fn region(&self) -> &SharedRegion {
        &self.region
    }

    /// Stage a request frame in the input region. The write ends with a
    /// release fence, so a subsequent flag store publishes it.
    pub fn write_input(&self, bytes: &[u8]) -> Result<(), RegionError> {
        if bytes.len() > SIZE_INPUT {
            return Err(RegionError::OutOfBounds {
                offset: OFFSET_INPUT,
                len: bytes.len(),
                capacity: SIZE_INPUT,
            });
        }
        self.region.write(OFFSET_INPUT, bytes)
    }

    pub fn kick(&self, worker: usize, task: TaskCode) -> Result<(), RegionError> {
        self.region.flag(worker)?.store(task as u32, Ordering::Release);
        Ok(())
    }

    pub fn kick_all(&self, task: TaskCode) -> Result<(), RegionError> {
        for worker in 0..self.workers {
            self.kick(worker, task)?;
        }
        Ok(())
    }

    /// post(worker, task, input): stage then kick, per the transport contract.
    pub fn post(&self, worker: usize, task: TaskCode, input: &[u8]) -> Result<(), RegionError> {
        self.write_input(input)?;
        self.kick(worker, task)
    }

    /// Spin until the worker clears its flag. No timeout: a wedged worker
    /// wedges the client; both run under the same supervisor.
    pub fn wait(&self, worker: usize) -> Result<(), RegionError> {
        let flag = self.region.flag(worker)?;
        let mut spins = 0u32;
        while flag.load(Ordering::Acquire) != 0 {
            spins += 1;
            if spins < SPIN_LIMIT {
                std::hint::spin_loop();
            } else {
                std::thread::yield_now();
            }
        }
        Ok(())
    }

    pub fn wait_all(&self) -> Result<(), RegionError> {
        for worker in 0..self.workers {
            self.wait(worker)?;
        }
        Ok(())
    }

    /// Read from the output region. Valid after the owning worker's flag
    /// has been observed at zero.
    pub fn read_output(&self, offset: usize, dest: &mut [u8]) -> Result<(), RegionError> {
        if offset + dest.len() > SIZE_OUTPUT {
            return Err(RegionError::OutOfBounds {
                offset,
                len: dest.len(),
                capacity: SIZE_OUTPUT,
            });
        }
        self.region.read(OFFSET_OUTPUT + offset, dest)
    }

    pub fn read_output_u32(&self, offset: usize) -> Result<u32, RegionError> {
        let mut buf = [0u8; 4];
        self.read_output(offset, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }
}

/// Worker end of the mailbox: consumer of its own flag word, reader of the
/// input region, writer of its output bands.
#[derive(Clone)]
pub struct WorkerPort {
    region: SharedRegion,
    id: usize,
}

impl WorkerPort {
    pub fn new(region: SharedRegion, id: usize) -> Result<Self, RegionError> {
        region.flag(id)?;
        Ok(Self { region, id })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Read the flag word; `Some(raw)` when a task is posted.
    pub fn poll(&self) -> Option<u32> {
        let raw = self
            .region
            .flag(self.id)
            .expect("flag validated at construction")
            .load(Ordering::Acquire);
        if raw == 0 {
            None
        } else {
            Some(raw)
        }
    }

    pub fn read_input(&self, offset: usize, dest: &mut [u8]) -> Result<(), RegionError> {
        if offset + dest.len() > SIZE_INPUT {
            return Err(RegionError::OutOfBounds {
                offset,
                len: dest.len(),
                capacity: SIZE_INPUT,
            });
        }
        self.region.read(OFFSET_INPUT + offset, dest)
    }

    pub fn read_input_vec(&self, offset: usize, len: usize) -> Result<Vec<u8>, RegionError> {
        let mut buf = vec![0u8; len];
        self.read_input(offset, &mut buf)?;
        Ok(buf)
    }

    pub fn write_output(&self, offset: usize, data: &[u8]) -> Result<(), RegionError> {
        if offset + data.len() > SIZE_OUTPUT {
            return Err(RegionError::OutOfBounds {
                offset,
                len: data.len(),
                capacity: SIZE_OUTPUT,
            });
        }
        self.region.write(OFFSET_OUTPUT + offset, data)
    }

    /// Clear the flag with a release store; the client then sees every
    /// output write this op made.
    pub fn complete(&self) {
        self.region
            .flag(self.id)
            .expect("flag validated at construction")
            .store(0, Ordering::Release);
    }
}
