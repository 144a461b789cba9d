use span_batcher::encoder::encode_record;
use span_batcher::span::PEER_SERVICE_TAG;
use span_batcher::{
    BatchExporter, Envelope, ExportError, ExporterConfig, GrowableBuffer, InMemoryTransport, Protocol, RpcCode,
    SpanRecord, TransportBoxed, TransportFailure, TransportStatus,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};

fn encoded_len(span: &SpanRecord) -> usize {
    let mut buf = GrowableBuffer::new();
    encode_record(&mut buf, span).len
}

/// A span whose Thrift encoding is exactly `size` bytes.
fn span_of_size(span_id: u64, peer: Option<&str>, size: usize) -> SpanRecord {
    let mut span = SpanRecord::new(0xABCDu128, span_id, "");
    if let Some(peer) = peer {
        span = span.with_tag(PEER_SERVICE_TAG, peer);
    }
    span.operation_name = "x".repeat(size - encoded_len(&span));
    assert_eq!(encoded_len(&span), size);
    span
}

fn in_memory_exporter(config: &ExporterConfig) -> (BatchExporter, Arc<InMemoryTransport>) {
    let transport = Arc::new(InMemoryTransport::new(Envelope::Batch));
    let exporter = BatchExporter::with_transport(config, Arc::clone(&transport) as Arc<dyn TransportBoxed>).unwrap();
    (exporter, transport)
}

fn process_len(service: &str, config: &ExporterConfig) -> usize {
    let mut cache = span_batcher::ProcessCache::new(config.process_tag_list());
    cache.get_or_create(service).len()
}

#[tokio::test(start_paused = true)]
async fn test_two_services_end_to_end() {
    let config = ExporterConfig::default()
        .with_service_name("A")
        .with_process_tag("host", "h")
        .with_max_packet_size(2000);
    let (exporter, transport) = in_memory_exporter(&config);

    for i in 0..5 {
        exporter.append(&span_of_size(i, None, 200)).await.unwrap();
    }
    for i in 5..7 {
        exporter.append(&span_of_size(i, Some("B"), 200)).await.unwrap();
    }
    assert_eq!(transport.delivered_count(), 0, "nothing crosses the threshold");

    assert_eq!(exporter.flush().await, 7);
    let delivered = transport.delivered();
    assert_eq!(delivered.len(), 2);

    let overhead = Envelope::Batch.overhead();
    assert_eq!(delivered[0].len(), overhead + process_len("A", &config) + 5 * 200);
    assert_eq!(delivered[1].len(), overhead + process_len("B", &config) + 2 * 200);
    assert!(delivered.iter().all(|p| p.len() <= 2000));
}

#[tokio::test(start_paused = true)]
async fn test_threshold_sends_during_append() {
    let config = ExporterConfig::default()
        .with_service_name("A")
        .with_process_tag("h", "1")
        .with_max_packet_size(1000);
    let (exporter, transport) = in_memory_exporter(&config);

    for i in 0..3 {
        exporter.append(&span_of_size(i, None, 300)).await.unwrap();
    }
    assert_eq!(transport.delivered_count(), 0);

    exporter.append(&span_of_size(3, None, 300)).await.unwrap();
    assert_eq!(transport.delivered_count(), 1);
    assert_eq!(
        transport.delivered()[0].len(),
        Envelope::Batch.overhead() + process_len("A", &config) + 900
    );
    assert_eq!(exporter.pending_spans().await, 1);
    assert_eq!(exporter.metrics().spans_exported(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_idle_timer_respects_interval() {
    let config = ExporterConfig::default().with_max_flush_interval(Duration::from_millis(500));
    let (exporter, transport) = in_memory_exporter(&config);

    exporter.append(&span_of_size(1, None, 100)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;
    exporter.append(&span_of_size(2, None, 100)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    // one timer armed by the first append covers both spans
    assert_eq!(transport.delivered_count(), 1);
    assert_eq!(exporter.metrics().spans_exported(), 2);

    exporter.append(&span_of_size(3, None, 100)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(transport.delivered_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_retry_through_exporter() {
    let config = ExporterConfig::default().with_timeout(Duration::from_secs(30));
    let (exporter, transport) = in_memory_exporter(&config);
    transport.fail_next(2, TransportFailure::new(TransportStatus::Rpc(RpcCode::Unavailable), "restarting"));

    exporter.append(&span_of_size(1, None, 100)).await.unwrap();
    assert_eq!(exporter.flush().await, 1);
    assert_eq!(transport.attempts(), 3);
    assert_eq!(exporter.metrics().retries(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_retry_gives_up_at_deadline() {
    let config = ExporterConfig::default().with_timeout(Duration::from_secs(3));
    let (exporter, transport) = in_memory_exporter(&config);
    transport.fail_next(10_000, TransportFailure::new(TransportStatus::Http(503), "busy"));

    exporter.append(&span_of_size(1, None, 100)).await.unwrap();
    let start = tokio::time::Instant::now();
    assert_eq!(exporter.flush().await, 0);
    assert!(start.elapsed() <= Duration::from_secs(3));
    assert_eq!(exporter.metrics().spans_dropped(), 1);
    assert_eq!(exporter.pending_spans().await, 0, "failed batches are not requeued");
}

#[tokio::test]
async fn test_record_too_large_is_rejected() {
    let config = ExporterConfig::default().with_max_packet_size(500);
    let (exporter, transport) = in_memory_exporter(&config);

    let err = exporter.append(&span_of_size(1, None, 600)).await.unwrap_err();
    assert!(matches!(err, ExportError::RecordTooLarge { .. }));
    assert_eq!(exporter.metrics().spans_rejected(), 1);
    assert_eq!(exporter.flush().await, 0);
    assert_eq!(transport.attempts(), 0);
}

#[tokio::test]
async fn test_append_after_shutdown() {
    let (exporter, transport) = in_memory_exporter(&ExporterConfig::default());
    exporter.append(&span_of_size(1, None, 100)).await.unwrap();

    assert_eq!(exporter.shutdown().await, 1);
    assert!(exporter.is_closed());
    assert!(transport.is_closed());
    assert!(matches!(exporter.append(&span_of_size(2, None, 100)).await, Err(ExportError::Closed)));
    assert_eq!(exporter.shutdown().await, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_appends() {
    let config = ExporterConfig::default().with_max_packet_size(4000);
    let (exporter, transport) = in_memory_exporter(&config);

    let mut tasks = vec![];
    for producer in 0..8u64 {
        let exporter = exporter.clone();
        tasks.push(tokio::spawn(async move {
            let service = format!("svc-{}", producer % 3);
            for seq in 0..250 {
                let span = SpanRecord::new(producer as u128, producer << 32 | seq, "op")
                    .with_tag(PEER_SERVICE_TAG, service.as_str());
                exporter.append(&span).await.unwrap();
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    exporter.shutdown().await;
    let metrics = exporter.metrics().snapshot();
    assert_eq!(metrics.spans_appended, 2000);
    assert_eq!(metrics.spans_exported, 2000);
    assert_eq!(metrics.spans_dropped, 0);
    assert!(transport.delivered().iter().all(|p| p.len() <= 4000));
}

#[tokio::test]
async fn test_udp_agent_receives_emit_batch() {
    let agent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let port = agent.local_addr().unwrap().port();
    let config = ExporterConfig::default()
        .with_service_name("udp-svc")
        .with_agent("127.0.0.1", port);
    let exporter = BatchExporter::from_config(&config).unwrap();
    assert_eq!(exporter.transport_name(), "udp");

    exporter.append(&SpanRecord::new(1u128, 1, "datagram-op")).await.unwrap();
    assert_eq!(exporter.flush().await, 1);

    let mut buf = vec![0u8; 65_536];
    let n = tokio::time::timeout(Duration::from_secs(5), agent.recv(&mut buf))
        .await
        .unwrap()
        .unwrap();
    let datagram = &buf[..n];
    assert_eq!(&datagram[..4], &[0x80, 0x01, 0x00, 0x04], "strict oneway header");
    assert!(datagram.windows(b"emitBatch".len()).any(|w| w == b"emitBatch"));
    assert!(datagram.windows(b"udp-svc".len()).any(|w| w == b"udp-svc"));
    assert!(datagram.windows(b"datagram-op".len()).any(|w| w == b"datagram-op"));

    exporter.shutdown().await;
}

/// Reads one HTTP/1.1 request and returns (head, body).
async fn read_request(stream: &mut tokio::net::TcpStream) -> (String, Vec<u8>) {
    let mut data = Vec::new();
    let mut chunk = [0u8; 4096];
    let head_end = loop {
        let n = stream.read(&mut chunk).await.unwrap();
        assert!(n > 0, "client closed before sending a request");
        data.extend_from_slice(&chunk[..n]);
        if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };
    let head = String::from_utf8_lossy(&data[..head_end]).to_string();
    let content_length: usize = head
        .lines()
        .find_map(|l| {
            let (k, v) = l.split_once(':')?;
            k.eq_ignore_ascii_case("content-length").then(|| v.trim().parse().ok())?
        })
        .unwrap_or(0);
    while data.len() < head_end + content_length {
        let n = stream.read(&mut chunk).await.unwrap();
        data.extend_from_slice(&chunk[..n]);
    }
    (head, data[head_end..head_end + content_length].to_vec())
}

#[tokio::test]
async fn test_http_collector_throttle_then_accept() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let mut requests = Vec::new();
        let responses = [
            "HTTP/1.1 503 Service Unavailable\r\nRetry-After: 1\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
            "HTTP/1.1 202 Accepted\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        ];
        for response in responses {
            let (mut stream, _) = listener.accept().await.unwrap();
            requests.push(read_request(&mut stream).await);
            stream.write_all(response.as_bytes()).await.unwrap();
            stream.shutdown().await.ok();
        }
        requests
    });

    let config = ExporterConfig::default()
        .with_protocol(Protocol::Http)
        .with_endpoint(format!("http://{}/api/traces", addr))
        .with_header("x-tenant", "blue")
        .with_timeout(Duration::from_secs(10));
    let exporter = BatchExporter::from_config(&config).unwrap();

    exporter.append(&SpanRecord::new(5u128, 5, "http-op")).await.unwrap();
    let started = std::time::Instant::now();
    assert_eq!(exporter.flush().await, 1);
    assert!(started.elapsed() >= Duration::from_secs(1), "throttle hint must be honored");
    assert_eq!(exporter.metrics().retries(), 1);

    let requests = server.await.unwrap();
    assert_eq!(requests.len(), 2);
    for (head, body) in &requests {
        let head = head.to_ascii_lowercase();
        assert!(head.starts_with("post /api/traces"));
        assert!(head.contains("content-type: application/vnd.apache.thrift.binary"));
        assert!(head.contains("x-tenant: blue"));
        assert!(body.windows(b"http-op".len()).any(|w| w == b"http-op"));
        assert_ne!(body[..2], [0x80, 0x01], "http carries a bare batch");
    }
    assert_eq!(requests[0].1, requests[1].1, "retry resends the same payload");

    exporter.shutdown().await;
}

#[tokio::test]
async fn test_http_unbounded_retry_after_drops_batch() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        read_request(&mut stream).await;
        let response = "HTTP/1.1 503 Service Unavailable\r\nRetry-After: 18446744073709551615\r\n\
                        Content-Length: 0\r\nConnection: close\r\n\r\n";
        stream.write_all(response.as_bytes()).await.unwrap();
        stream.shutdown().await.ok();
    });

    let config = ExporterConfig::default()
        .with_protocol(Protocol::Http)
        .with_endpoint(format!("http://{}/api/traces", addr))
        .with_timeout(Duration::from_secs(10));
    let exporter = BatchExporter::from_config(&config).unwrap();

    exporter.append(&SpanRecord::new(6u128, 6, "http-op")).await.unwrap();
    assert_eq!(exporter.flush().await, 0);
    assert_eq!(exporter.metrics().spans_dropped(), 1);
    assert_eq!(exporter.metrics().retries(), 0);

    server.await.unwrap();
    exporter.shutdown().await;
}

#[tokio::test]
async fn test_config_from_json() {
    let config = ExporterConfig::from_json(
        r#"{"service_name": "json-svc", "protocol": "http", "max_packet_size": 1500, "max_flush_interval_ms": 250}"#,
    )
    .unwrap();
    assert_eq!(config.protocol, Protocol::Http);
    assert_eq!(config.max_flush_interval, Duration::from_millis(250));

    let (exporter, transport) = in_memory_exporter(&config);
    exporter.append(&span_of_size(1, None, 100)).await.unwrap();
    assert_eq!(exporter.shutdown().await, 1);
    assert_eq!(transport.delivered_count(), 1);
}
