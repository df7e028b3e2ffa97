use meshstream_codec::{
    FrameDecoder, FrameEncoder, MeshSample, PlaybackConfig, PlaybackPhase, PlaybackState,
    TileGrid, Transform,
};
use std::time::Duration;

fn sample(x: f32) -> Vec<MeshSample> {
    vec![MeshSample {
        vertices: vec![[x, 0.0, 0.0]],
        transform: Transform::identity(),
    }]
}

#[test]
fn render_blends_between_applied_frames() {
    let grid = TileGrid::default();
    let mut encoder = FrameEncoder::new(grid, 0);
    let mut decoder = FrameDecoder::new(grid, &[1]);
    let mut playback = PlaybackState::default();

    let first = encoder.encode(sample(0.0), [0.0; 3]).unwrap();
    playback.on_update(decoder.apply(&first.to_packet(false)).unwrap().kind);
    for _ in 0..10 {
        playback.advance(Duration::from_millis(10));
    }

    let second = encoder.encode(sample(1.0), [2.0, 0.0, 0.0]).unwrap();
    playback.on_update(decoder.apply(&second.to_packet(false)).unwrap().kind);

    let start = playback.render(&decoder);
    assert_eq!(start.meshes[0][0], [0.0, 0.0, 0.0]);
    assert_eq!(start.translation, [0.0, 0.0, 0.0]);

    for _ in 0..5 {
        playback.advance(Duration::from_millis(10));
    }
    let middle = playback.render(&decoder);
    assert!((middle.meshes[0][0][0] - 0.5).abs() < 1e-4);
    assert!((middle.translation[0] - 1.0).abs() < 1e-4);

    for _ in 0..10 {
        playback.advance(Duration::from_millis(10));
    }
    assert_eq!(playback.phase(), PlaybackPhase::Snapped);
    assert_eq!(playback.render(&decoder).meshes[0][0], [1.0, 0.0, 0.0]);
}

#[test]
fn stalled_fragment_stream_snaps_to_latest() {
    let grid = TileGrid::default();
    let mut encoder = FrameEncoder::new(grid, 4);
    let mut decoder = FrameDecoder::new(grid, &[1]);
    let mut playback = PlaybackState::new(PlaybackConfig {
        time_span: Duration::from_millis(50),
        ..Default::default()
    });

    for x in [0.0, 0.25] {
        let frame = encoder.encode(sample(x), [0.0; 3]).unwrap();
        playback.on_update(decoder.apply(&frame.to_packet(false)).unwrap().kind);
    }
    assert_eq!(playback.phase(), PlaybackPhase::Interpolating);

    let weight = playback.advance(Duration::from_millis(120));
    assert_eq!(weight, 1.0);
    assert_eq!(playback.phase(), PlaybackPhase::LagCatchup);
    assert_eq!(playback.render(&decoder).meshes[0][0], decoder.current()[0][0]);
}
