//! Bounded queues between the sensor producers and the logging task.
//!
//! Producers never wait longer than their send timeout. A sample that can't be queued in time is
//! dropped and counted.

use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::{self, Receiver, SendTimeoutError, Sender};
use log::trace;
use novafc_data_format::SensorSample;
use serde::{Deserialize, Serialize};

use crate::stats::{bump, RecorderStats};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueueKind {
    /// Accelerometer and gyroscope
    Inertial,
    /// Pressure and temperature
    Barometric,
}

/// Sending half of a sample queue
#[derive(Clone)]
pub struct SampleProducer {
    kind: QueueKind,
    tx: Sender<SensorSample>,
    send_timeout: Duration,
    stats: Arc<RecorderStats>,
}

impl SampleProducer {
    /// Queues `sample`, returning false if it was dropped
    pub fn submit(&self, sample: SensorSample) -> bool {
        match self.tx.send_timeout(sample, self.send_timeout) {
            Ok(()) => true,
            Err(SendTimeoutError::Timeout(_)) => {
                trace!("{:?} queue full, dropping sample", self.kind);
                bump(&self.stats.dropped_samples);
                false
            }
            Err(SendTimeoutError::Disconnected(_)) => {
                trace!("{:?} queue closed, dropping sample", self.kind);
                bump(&self.stats.dropped_samples);
                false
            }
        }
    }

    pub fn kind(&self) -> QueueKind {
        self.kind
    }

    /// Number of samples waiting in the queue
    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }
}

/// One producer per queue
#[derive(Clone)]
pub struct Producers {
    pub inertial: SampleProducer,
    pub barometric: SampleProducer,
}

impl Producers {
    /// The producer responsible for `sample`
    pub fn for_sample(&self, sample: &SensorSample) -> &SampleProducer {
        match sample {
            SensorSample::Inertial { .. }
            | SensorSample::Accelerometer { .. }
            | SensorSample::Gyroscope { .. } => &self.inertial,
            SensorSample::Pressure { .. } | SensorSample::Temperature { .. } => &self.barometric,
        }
    }

    /// Routes `sample` to its queue
    pub fn submit(&self, sample: SensorSample) -> bool {
        self.for_sample(&sample).submit(sample)
    }
}

/// Receiving halves, owned by the logging task
pub struct QueueReceivers {
    pub inertial: Receiver<SensorSample>,
    pub barometric: Receiver<SensorSample>,
}

/// Creates the inertial and barometric queues, each holding `depth` samples
pub fn sample_queues(
    depth: usize,
    send_timeout: Duration,
    stats: Arc<RecorderStats>,
) -> (Producers, QueueReceivers) {
    let (inertial_tx, inertial_rx) = channel::bounded(depth);
    let (barometric_tx, barometric_rx) = channel::bounded(depth);
    let producer = |kind: QueueKind, tx: Sender<SensorSample>| SampleProducer {
        kind,
        tx,
        send_timeout,
        stats: Arc::clone(&stats),
    };
    (
        Producers {
            inertial: producer(QueueKind::Inertial, inertial_tx),
            barometric: producer(QueueKind::Barometric, barometric_tx),
        },
        QueueReceivers {
            inertial: inertial_rx,
            barometric: barometric_rx,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routes_by_sensor() {
        let stats = Arc::new(RecorderStats::new());
        let (producers, receivers) = sample_queues(4, Duration::from_millis(1), stats);

        assert!(producers.submit(SensorSample::Pressure { pressure: 1 }));
        assert!(producers.submit(SensorSample::Gyroscope { gyro: [1, 2, 3] }));
        assert!(producers.submit(SensorSample::Temperature { temp: -5 }));

        assert_eq!(receivers.inertial.len(), 1);
        assert_eq!(receivers.barometric.len(), 2);
        assert_eq!(
            receivers.barometric.recv().unwrap(),
            SensorSample::Pressure { pressure: 1 }
        );
    }

    #[test]
    fn full_queue_drops_and_counts() {
        let stats = Arc::new(RecorderStats::new());
        let (producers, _receivers) =
            sample_queues(2, Duration::from_millis(1), Arc::clone(&stats));
        let sample = SensorSample::Accelerometer { accel: [0, 0, 1] };

        assert!(producers.inertial.submit(sample));
        assert!(producers.inertial.submit(sample));
        assert!(!producers.inertial.submit(sample));
        assert_eq!(producers.inertial.len(), 2);
        assert_eq!(stats.snapshot().dropped_samples, 1);
    }

    #[test]
    fn closed_queue_drops_and_counts() {
        let stats = Arc::new(RecorderStats::new());
        let (producers, receivers) =
            sample_queues(2, Duration::from_millis(1), Arc::clone(&stats));
        drop(receivers);

        assert!(!producers.submit(SensorSample::Pressure { pressure: 0 }));
        assert_eq!(stats.snapshot().dropped_samples, 1);
    }
}
