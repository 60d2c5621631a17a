// Console device: the byte streams behind file descriptors 0 and 1.
//
// Input is a queue the host (or a test) feeds; output accumulates until
// drained. Reads return what is available rather than blocking, since the
// crate has no scheduler to sleep on.

use std::collections::VecDeque;
use std::sync::Mutex;

pub struct Console {
    input: Mutex<VecDeque<u8>>,
    output: Mutex<Vec<u8>>,
}

impl Console {
    pub fn new() -> Self {
        Self {
            input: Mutex::new(VecDeque::new()),
            output: Mutex::new(Vec::new()),
        }
    }

    /// Queues bytes for the next console read.
    pub fn feed_input(&self, bytes: &[u8]) {
        self.input.lock().unwrap().extend(bytes.iter().copied());
    }

    /// Drains everything written so far.
    pub fn take_output(&self) -> Vec<u8> {
        std::mem::take(&mut *self.output.lock().unwrap())
    }

    pub fn read(&self, dst: &mut [u8]) -> usize {
        let mut input = self.input.lock().unwrap();
        let n = dst.len().min(input.len());
        for b in dst[..n].iter_mut() {
            *b = input.pop_front().unwrap();
        }
        n
    }

    pub fn write(&self, src: &[u8]) -> usize {
        self.output.lock().unwrap().extend_from_slice(src);
        src.len()
    }
}

impl Default for Console {
    fn default() -> Self {
        Self::new()
    }
}
