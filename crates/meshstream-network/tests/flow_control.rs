use meshstream_codec::{
    CompressionAlgorithm, EncodedFrame, FrameEncoder, FrameKind, MeshSample, TileGrid, Transform,
};
use meshstream_network::{
    ChannelEvent, ConnectionId, EventReceiver, MemoryChannel, Message, MessageChannel,
    NetworkError, StreamChannel, MAX_OUTSTANDING,
};
use std::sync::Arc;

struct Sample {
    encoder: FrameEncoder,
    tick: f32,
}

impl Sample {
    fn new(subframes: u32) -> Self {
        Self {
            encoder: FrameEncoder::new(TileGrid::default(), subframes)
                .with_compression(Some(CompressionAlgorithm::Zstd)),
            tick: 0.0,
        }
    }

    fn next(&mut self) -> EncodedFrame {
        self.tick += 0.01;
        let vertices = (0..16)
            .map(|i| [i as f32 * 0.05, self.tick, -0.25])
            .collect();
        self.encoder
            .encode(
                vec![MeshSample {
                    vertices,
                    transform: Transform::identity(),
                }],
                [0.0; 3],
            )
            .unwrap()
    }
}

fn drain(rx: &mut EventReceiver) -> Vec<ChannelEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn frames_received(events: &[ChannelEvent]) -> Vec<u8> {
    events
        .iter()
        .filter_map(|event| match event {
            ChannelEvent::Message(_, bytes) => bytes.first().copied(),
            _ => None,
        })
        .collect()
}

fn setup() -> (
    StreamChannel<MemoryChannel>,
    ConnectionId,
    MemoryChannel,
    EventReceiver,
) {
    let (server, _server_rx) = MemoryChannel::listen();
    let (client, client_rx) = server.connect();
    let at_server = server.connections()[0];
    let mut stream = StreamChannel::new(Arc::new(server));
    stream.on_connected(at_server);
    (stream, at_server, client, client_rx)
}

#[tokio::test]
async fn test_no_connection() {
    let (server, _rx) = MemoryChannel::listen();
    let mut stream = StreamChannel::new(Arc::new(server));
    let mut sample = Sample::new(4);
    assert!(matches!(
        stream.send_vertex_stream(&sample.next()).await,
        Err(NetworkError::NoConnection)
    ));
}

#[tokio::test]
async fn test_nothing_sent_before_ready() {
    let (mut stream, _, _client, mut client_rx) = setup();
    let mut sample = Sample::new(4);

    assert_eq!(stream.send_vertex_stream(&sample.next()).await.unwrap(), 0);
    assert!(frames_received(&drain(&mut client_rx)).is_empty());
}

#[tokio::test]
async fn test_backpressure_stops_and_resumes() {
    let (mut stream, at_server, _client, mut client_rx) = setup();
    let mut sample = Sample::new(0);
    stream.handle_control(at_server, &Message::Ready { accepts_compression: false });

    // Every frame is a keyframe with no subframes
    for _ in 0..=MAX_OUTSTANDING {
        assert_eq!(stream.send_vertex_stream(&sample.next()).await.unwrap(), 1);
    }
    let state = stream.state(at_server).unwrap();
    assert!(state.temporal_stop);
    assert_eq!(state.send_queue_depth, MAX_OUTSTANDING + 1);

    assert_eq!(stream.send_vertex_stream(&sample.next()).await.unwrap(), 0);
    let received = frames_received(&drain(&mut client_rx));
    assert_eq!(received.len(), (MAX_OUTSTANDING + 1) as usize);

    for _ in 0..MAX_OUTSTANDING {
        stream.handle_control(at_server, &Message::Ack);
        assert_eq!(stream.send_vertex_stream(&sample.next()).await.unwrap(), 0);
    }
    stream.handle_control(at_server, &Message::Ack);
    assert!(!stream.state(at_server).unwrap().temporal_stop);

    assert_eq!(stream.send_vertex_stream(&sample.next()).await.unwrap(), 1);
    assert_eq!(frames_received(&drain(&mut client_rx)).len(), 1);
}

#[tokio::test]
async fn test_slow_receiver_does_not_stall_others() {
    let (server, _server_rx) = MemoryChannel::listen();
    let (_slow, mut slow_rx) = server.connect();
    let (_fast, mut fast_rx) = server.connect();
    let ids = server.connections();
    let (slow_id, fast_id) = (ids[0], ids[1]);

    let mut stream = StreamChannel::new(Arc::new(server));
    for id in [slow_id, fast_id] {
        stream.on_connected(id);
        stream.handle_control(id, &Message::Ready { accepts_compression: true });
    }

    let mut sample = Sample::new(0);
    for _ in 0..30 {
        stream.send_vertex_stream(&sample.next()).await.unwrap();
        stream.handle_control(fast_id, &Message::Ack);
    }

    assert_eq!(
        frames_received(&drain(&mut slow_rx)).len(),
        (MAX_OUTSTANDING + 1) as usize
    );
    assert_eq!(frames_received(&drain(&mut fast_rx)).len(), 30);
}

#[tokio::test]
async fn test_fragments_wait_for_keyframe_after_stop() {
    let (mut stream, at_server, _client, mut client_rx) = setup();
    let mut sample = Sample::new(1000);
    stream.handle_control(at_server, &Message::Ready { accepts_compression: false });

    for _ in 0..=MAX_OUTSTANDING {
        stream.send_vertex_stream(&sample.next()).await.unwrap();
    }
    // Dropped while stopped
    stream.send_vertex_stream(&sample.next()).await.unwrap();
    for _ in 0..=MAX_OUTSTANDING {
        stream.handle_control(at_server, &Message::Ack);
    }
    drain(&mut client_rx);

    assert!(stream.needs_keyframe());
    let fragment = sample.next();
    assert_eq!(fragment.kind, FrameKind::Fragment);
    assert_eq!(stream.send_vertex_stream(&fragment).await.unwrap(), 0);

    sample.encoder.force_keyframe();
    let keyframe = sample.next();
    assert_eq!(keyframe.kind, FrameKind::Keyframe);
    assert_eq!(stream.send_vertex_stream(&keyframe).await.unwrap(), 1);
    assert!(!stream.needs_keyframe());
    assert_eq!(stream.send_vertex_stream(&sample.next()).await.unwrap(), 1);

    assert_eq!(frames_received(&drain(&mut client_rx)), vec![0x0F, 0x0E]);
}

#[tokio::test]
async fn test_compression_chosen_per_connection() {
    let (server, _server_rx) = MemoryChannel::listen();
    let (_a, mut raw_rx) = server.connect();
    let (_b, mut zstd_rx) = server.connect();
    let ids = server.connections();

    let mut stream = StreamChannel::new(Arc::new(server));
    stream.on_connected(ids[0]);
    stream.on_connected(ids[1]);
    stream.handle_control(ids[0], &Message::Ready { accepts_compression: false });
    stream.handle_control(ids[1], &Message::Ready { accepts_compression: true });

    let mut sample = Sample::new(4);
    stream.send_vertex_stream(&sample.next()).await.unwrap();

    let raw = match drain(&mut raw_rx).pop() {
        Some(ChannelEvent::Message(_, bytes)) => bytes,
        other => panic!("expected frame, got {other:?}"),
    };
    let compressed = match drain(&mut zstd_rx).pop() {
        Some(ChannelEvent::Message(_, bytes)) => bytes,
        other => panic!("expected frame, got {other:?}"),
    };
    assert_eq!(raw[8], 0);
    assert_eq!(compressed[8], CompressionAlgorithm::Zstd.wire_id());
}

#[tokio::test]
async fn test_disconnect_removes_state() {
    let (mut stream, at_server, _client, _client_rx) = setup();
    stream.on_disconnected(at_server);
    assert!(stream.state(at_server).is_none());
    assert!(stream.table().is_empty());
    assert!(!stream.handle_control(at_server, &Message::ServerClose));
}
