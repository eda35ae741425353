use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use opik_streamer::{
    Batch, BatchingConfig, Client, EventRecord, NullSink, StreamBuffer, StreamKind, Transport,
    TransportError,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

// Accepts everything without doing any work.
struct DiscardTransport;

#[async_trait::async_trait]
impl Transport for DiscardTransport {
    async fn submit(&self, batch: &Batch) -> Result<(), TransportError> {
        black_box(batch.len());
        Ok(())
    }
}

fn span(i: usize) -> EventRecord {
    EventRecord::new(
        StreamKind::Span,
        format!("span-{i}"),
        json!({ "id": format!("span-{i}"), "name": "llm-call", "input": { "prompt": "hello" } }),
    )
}

fn buffer_enqueue_drain(c: &mut Criterion) {
    c.bench_function("stream_buffer_enqueue_drain_1k", |b| {
        b.iter_batched(
            || {
                let records: Vec<_> = (0..1000).map(span).collect();
                (StreamBuffer::new(StreamKind::Span, 10_000, 100), records)
            },
            |(buffer, records)| {
                for record in records {
                    let _ = black_box(buffer.try_enqueue(record));
                }
                while !buffer.drain(100).is_empty() {}
            },
            BatchSize::SmallInput,
        );
    });
}

fn client_report_throughput(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let client = rt.block_on(async {
        Client::builder(Arc::new(DiscardTransport))
            .config(BatchingConfig {
                max_batch_size: 100,
                flush_interval: Duration::from_millis(10),
                ..BatchingConfig::default()
            })
            .sink(NullSink)
            .build()
            .unwrap()
    });

    let reporter = &client;
    c.bench_function("client_report_span", |b| {
        let mut i = 0;
        b.to_async(&rt).iter(|| {
            i += 1;
            let record = span(i);
            async move {
                // Full buffers are expected under sustained load.
                let _ = black_box(reporter.report(record).await);
            }
        });
    });

    rt.block_on(client.shutdown());
}

criterion_group!(benches, buffer_enqueue_drain, client_report_throughput);
criterion_main!(benches);
