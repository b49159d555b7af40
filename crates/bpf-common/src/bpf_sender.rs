//! The [`BpfSender`] trait is used by [`crate::Program`] to send raw records and errors.
//!
//! [`BpfSender::send`] must not block since it can be used in async contexts

use tokio::sync::mpsc;

use crate::ProgramError;

pub trait BpfSender<T>: Clone + Send + 'static {
    /// Must not block since it can be used in async contexts
    fn send(&mut self, data: Result<T, ProgramError>);
}

/// Simple implementation for tokio::mpsc bounded channels.
/// Sending with full channel will drop messages.
impl<T: 'static + Send> BpfSender<T> for mpsc::Sender<Result<T, ProgramError>> {
    fn send(&mut self, data: Result<T, ProgramError>) {
        if self.try_send(data).is_err() {
            log::warn!("dropping msg");
        }
    }
}

/// Unbounded channels never drop, useful when the consumer is known to keep up.
impl<T: 'static + Send> BpfSender<T> for mpsc::UnboundedSender<Result<T, ProgramError>> {
    fn send(&mut self, data: Result<T, ProgramError>) {
        if mpsc::UnboundedSender::send(self, data).is_err() {
            log::warn!("receiver closed, dropping msg");
        }
    }
}
