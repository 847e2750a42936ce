use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use inoflow_common::{RecordFs, RECORD_TYPE_FILE};
use log::{debug, warn};

use crate::output::Output;

const POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Drain the emission channel until the shutdown flag is set.
///
/// Runs as one long-lived blocking task. An empty poll interval is normal;
/// cancellation is cooperative and checked between polls. Whatever is
/// already queued at shutdown is still delivered.
pub fn run(rx: Receiver<RecordFs>, output: &Output, shutdown: &AtomicBool) {
    while !shutdown.load(Ordering::Relaxed) {
        match rx.recv_timeout(POLL_TIMEOUT) {
            Ok(record) => deliver(&record, output),
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => return,
        }
    }
    for record in rx.try_iter() {
        deliver(&record, output);
    }
    debug!("consumer stopped");
}

fn deliver(record: &RecordFs, output: &Output) {
    if record.rtype != RECORD_TYPE_FILE {
        debug!("skipping record with unknown type {}", record.rtype);
        return;
    }
    if let Err(err) = output.emit(record) {
        warn!("failed to deliver record: {err}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    #[test]
    fn stops_on_shutdown_and_drains_the_backlog() {
        let (tx, rx) = bounded::<RecordFs>(8);
        let mut queued = RecordFs::zeroed();
        queued.rtype = RECORD_TYPE_FILE;
        tx.send(queued).unwrap();
        tx.send(queued).unwrap();

        let shutdown = Arc::new(AtomicBool::new(true));
        let output = Output::discard();
        // Shutdown already requested: the call must return promptly after
        // draining what is queued.
        run(rx, &output, &shutdown);
        assert!(tx.send(queued).is_ok());
    }

    #[test]
    fn disconnected_channel_terminates_the_loop() {
        let (tx, rx) = bounded::<RecordFs>(1);
        drop(tx);
        let shutdown = AtomicBool::new(false);
        run(rx, &Output::discard(), &shutdown);
    }
}
