use log::{debug, info, warn};

use crate::decoder;
use crate::mqtt::MetricPublisher;
use crate::tables::{TableDescriptor, TableReader, TableSource};

/// Where a poll cycle currently is with a single table
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PollState {
    Idle,
    Reading(TableDescriptor),
    Decoding(u16),
    Publishing(u16),
}

/// Outcome of one pass over all tables
#[derive(Debug, Default, Clone, PartialEq)]
pub struct CycleReport {
    pub tables_attempted: usize,
    pub read_failures: usize,
    pub empty_tables: usize,
    pub metrics_published: usize,
}

pub struct PollCycle<S: TableSource> {
    reader: TableReader<S>,
    publisher: MetricPublisher,
    tables: Vec<TableDescriptor>,
    state: PollState,
}

impl<S: TableSource> PollCycle<S> {
    pub fn new(reader: TableReader<S>, publisher: MetricPublisher, tables: &[TableDescriptor]) -> Self {
        Self {
            reader,
            publisher,
            tables: tables.to_vec(),
            state: PollState::Idle,
        }
    }

    pub fn state(&self) -> PollState {
        self.state
    }

    fn transition(&mut self, next: PollState) {
        debug!("Poll state {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    /// Reads, decodes and publishes every table once. A failing table never stops the others.
    pub async fn execute(&mut self) -> CycleReport {
        let mut report = CycleReport::default();
        let tables = self.tables.clone();

        for descriptor in tables.iter() {
            report.tables_attempted += 1;
            self.transition(PollState::Reading(*descriptor));

            let buffer = match self.reader.read(descriptor).await {
                Ok(b) => b,
                Err(e) => {
                    warn!("Skipping table {} this cycle: {}", descriptor.id, e);
                    report.read_failures += 1;
                    self.transition(PollState::Idle);
                    continue;
                }
            };

            self.transition(PollState::Decoding(descriptor.id));
            let values = decoder::decode(descriptor.id, &buffer);
            if values.is_empty() {
                debug!("Table {} produced no values", descriptor.id);
                report.empty_tables += 1;
                self.transition(PollState::Idle);
                continue;
            }

            self.transition(PollState::Publishing(descriptor.id));
            report.metrics_published += self.publisher.publish(&values);
            self.transition(PollState::Idle);
        }

        info!("Poll cycle done: {} tables, {} failed reads, {} metrics published",
              report.tables_attempted, report.read_failures, report.metrics_published);
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SourceConfig;
    use crate::mqtt::tests::{drain, meter_config};
    use crate::mqtt::{Transmission, OUTBOUND_QUEUE_SIZE};
    use crate::tables::tests::ScriptedSource;
    use crate::tables::POLLED_TABLES;

    fn le_bytes(values: &[i32]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    fn cycle(source: ScriptedSource, tables: &[TableDescriptor]) -> (PollCycle<ScriptedSource>, tokio::sync::mpsc::Receiver<Transmission>) {
        let config = SourceConfig { dump_dir: "tables".to_string(), read_retries: 0, retry_delay_ms: 1 };
        let (tx, rx) = tokio::sync::mpsc::channel(OUTBOUND_QUEUE_SIZE);
        let reader = TableReader::new(source, &config);
        let publisher = MetricPublisher::new(tx, &meter_config());
        (PollCycle::new(reader, publisher, tables), rx)
    }

    fn topics(sent: &[Transmission]) -> Vec<String> {
        let mut t: Vec<String> = sent.iter().map(|t| t.data().topic.clone()).collect();
        t.sort();
        t
    }

    #[tokio::test]
    async fn test_full_cycle() {
        let source = ScriptedSource::new()
            .answer(23, Ok(le_bytes(&[1000, 2000])))
            .answer(28, Ok(le_bytes(&[100, -50, 0, 0, 5000, 6000, 7000, 120000, 121000, 122000])));
        let (mut poll, mut rx) = cycle(source, &POLLED_TABLES);

        let report = poll.execute().await;
        assert_eq!(report, CycleReport { tables_attempted: 2, read_failures: 0, empty_tables: 0, metrics_published: 10 });
        assert_eq!(poll.state(), PollState::Idle);

        let sent = drain(&mut rx);
        assert_eq!(sent.len(), 10);
        assert!(sent.iter().all(|t| matches!(t, Transmission::Publish(d) if !d.retain && d.qos == 0)));

        let rev = sent.iter().map(|t| t.data()).find(|d| d.topic == "meter2mqtt/house/rev_Now").unwrap();
        assert_eq!(rev.payload, "-50");
        let volts = sent.iter().map(|t| t.data()).find(|d| d.topic == "meter2mqtt/house/L3_V").unwrap();
        assert_eq!(volts.payload, "122.0");
    }

    #[tokio::test]
    async fn test_failed_table_does_not_stop_next() {
        let source = ScriptedSource::new()
            .answer(23, Err("checksum mismatch"))
            .answer(28, Ok(le_bytes(&[1, 2, 0, 0, 3000, 3000, 3000, 230000, 230000, 230000])));
        let (mut poll, mut rx) = cycle(source, &POLLED_TABLES);

        let report = poll.execute().await;
        assert_eq!(report.read_failures, 1);
        assert_eq!(report.metrics_published, 8);
        assert_eq!(poll.reader_calls(), vec![(23, 8, 0), (28, 40, 0)]);

        let sent = drain(&mut rx);
        assert_eq!(topics(&sent), vec![
            "meter2mqtt/house/L1_A", "meter2mqtt/house/L1_V",
            "meter2mqtt/house/L2_A", "meter2mqtt/house/L2_V",
            "meter2mqtt/house/L3_A", "meter2mqtt/house/L3_V",
            "meter2mqtt/house/fwd_Now", "meter2mqtt/house/rev_Now",
        ]);
    }

    #[tokio::test]
    async fn test_unknown_table_publishes_nothing() {
        let source = ScriptedSource::new().answer(99, Ok(vec![1, 2, 3, 4]));
        let tables = [TableDescriptor { id: 99, offset: 0, length: 4 }];
        let (mut poll, mut rx) = cycle(source, &tables);

        let report = poll.execute().await;
        assert_eq!(report.empty_tables, 1);
        assert_eq!(report.metrics_published, 0);
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_short_read_still_published() {
        let source = ScriptedSource::new()
            .answer(23, Ok(vec![0xe8, 0x03]))
            .answer(28, Ok(Vec::new()));
        let (mut poll, mut rx) = cycle(source, &POLLED_TABLES);

        let report = poll.execute().await;
        assert_eq!(report.metrics_published, 10);

        let sent = drain(&mut rx);
        let fwd = sent.iter().map(|t| t.data()).find(|d| d.topic == "meter2mqtt/house/Fwd_kWh").unwrap();
        assert_eq!(fwd.payload, "1.0");
    }

    #[tokio::test]
    async fn test_repeated_triggers() {
        let source = ScriptedSource::new()
            .answer(23, Ok(le_bytes(&[1000, 2000])))
            .answer(28, Err("timeout"));
        let (mut poll, mut rx) = cycle(source, &POLLED_TABLES);

        for _ in 0..3 {
            let report = poll.execute().await;
            assert_eq!(report.metrics_published, 2);
            assert_eq!(report.read_failures, 1);
        }
        assert_eq!(drain(&mut rx).len(), 6);
    }

    impl PollCycle<ScriptedSource> {
        fn reader_calls(&self) -> Vec<(u16, usize, usize)> {
            self.reader.source().calls.clone()
        }
    }
}
