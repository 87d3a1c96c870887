//! Receive buffer that hands out complete lines

use crate::{
    constants::{MAX_BUFFER_SIZE, MAX_LINE_SIZE},
    error::{AmiError, AmiResult},
};

/// Byte buffer with a read cursor. Consumed bytes stay in place until
/// [`compact`](AmiBuffer::compact) is called.
#[derive(Debug, Default)]
pub(crate) struct AmiBuffer {
    data: Vec<u8>,
    pos: usize,
}

impl AmiBuffer {
    pub(crate) fn extend_from_slice(&mut self, bytes: &[u8]) {
        self.data
            .extend_from_slice(bytes);
    }

    /// Unconsumed byte count.
    pub(crate) fn len(&self) -> usize {
        self.data.len() - self.pos
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn check_size_limits(&self) -> AmiResult<()> {
        if self.len() > MAX_BUFFER_SIZE {
            return Err(AmiError::protocol_error(format!(
                "Receive buffer exceeded {} bytes",
                MAX_BUFFER_SIZE
            )));
        }
        Ok(())
    }

    /// Take the next `\n`-terminated line, without its terminator and without
    /// a trailing `\r`. `None` when no complete line is buffered.
    pub(crate) fn extract_line(&mut self) -> AmiResult<Option<Vec<u8>>> {
        let pending = &self.data[self.pos..];
        let Some(newline) = pending
            .iter()
            .position(|&b| b == b'\n')
        else {
            if pending.len() > MAX_LINE_SIZE {
                return Err(AmiError::protocol_error(format!(
                    "Line exceeds {} bytes without terminator",
                    MAX_LINE_SIZE
                )));
            }
            return Ok(None);
        };

        let mut line = pending[..newline].to_vec();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        self.pos += newline + 1;
        Ok(Some(line))
    }

    /// Drop consumed bytes.
    pub(crate) fn compact(&mut self) {
        if self.pos > 0 {
            self.data
                .drain(..self.pos);
            self.pos = 0;
        }
    }

    /// Take whatever is left, terminated or not.
    pub(crate) fn take_remaining(&mut self) -> Vec<u8> {
        let rest = self.data[self.pos..].to_vec();
        self.data.clear();
        self.pos = 0;
        rest
    }
}
