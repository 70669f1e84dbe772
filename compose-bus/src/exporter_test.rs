use std::time::Duration;

use crate::{
    config::ComposeConfig,
    encoder::ExportSettings,
    error::ComposeError,
    exporter::{CompositionEncoder, EncoderParts},
    frame::VideoFrame,
    mux_gate::GateState,
    render::SoftwareRenderer,
    stream::TrackKind,
    testing::{EncoderProbeHandle, EncoderScript, RecordingWriter, ScriptedEncoder},
};

const PCM: [u8; 4096] = [0u8; 4096];

struct Harness {
    encoder: CompositionEncoder,
    writer: RecordingWriter,
    video: EncoderProbeHandle,
    audio: EncoderProbeHandle,
}

fn harness(video: EncoderScript, audio: EncoderScript, writer: RecordingWriter) -> Harness {
    let video_encoder = ScriptedEncoder::new(video);
    let audio_encoder = ScriptedEncoder::new(audio);
    let probes = (video_encoder.probe_handle(), audio_encoder.probe_handle());
    let parts = EncoderParts {
        video_encoder: Box::new(video_encoder),
        audio_encoder: Box::new(audio_encoder),
        writer: Box::new(writer.clone()),
        renderer: Box::new(SoftwareRenderer),
    };
    let config = ComposeConfig {
        drain_timeout_ms: 1,
        ..Default::default()
    };
    Harness {
        encoder: CompositionEncoder::new(parts, &ExportSettings::default(), &config),
        writer,
        video: probes.0,
        audio: probes.1,
    }
}

fn frame(secs: f64) -> VideoFrame {
    VideoFrame::blank(4, 4, (secs * 1_000_000.0) as i64)
}

#[test]
fn test_export_round() -> anyhow::Result<()> {
    let h = harness(
        EncoderScript::new(TrackKind::Video),
        EncoderScript::new(TrackKind::Audio),
        RecordingWriter::default(),
    );
    h.encoder.prepare()?;
    assert_eq!(h.encoder.gate_state(), GateState::Started);

    for i in 0..3 {
        let t = i as f64 / 30.0;
        h.encoder.encode_video_frame(&frame(t), t)?;
        h.encoder.encode_audio_buffer(&PCM, t)?;
    }
    let summary = h.encoder.finalize_encoding()?;
    assert_eq!(summary.video.chunks_written, 3);
    assert_eq!(summary.audio.chunks_written, 3);
    assert_eq!(h.encoder.gate_state(), GateState::Finished);
    assert_eq!(h.video.probe().inputs, vec![0, 33_333, 66_667]);

    h.encoder.release();
    let log = h.writer.log();
    assert_eq!((log.start_calls, log.stop_calls, log.release_calls), (1, 1, 1));
    assert_eq!(h.video.probe().release_calls, 1);
    assert_eq!(h.audio.probe().release_calls, 1);
    Ok(())
}

#[test]
fn test_video_before_audio_format_is_dropped() -> anyhow::Result<()> {
    let mut audio = EncoderScript::new(TrackKind::Audio);
    audio.announce_after_inputs = 1;
    let h = harness(EncoderScript::new(TrackKind::Video), audio, RecordingWriter::default());
    h.encoder.prepare()?;
    assert_eq!(h.encoder.gate_state(), GateState::PartiallyRegistered);

    h.encoder.encode_video_frame(&frame(0.0), 0.0)?;
    h.encoder.encode_video_frame(&frame(0.1), 0.1)?;
    h.encoder.encode_audio_buffer(&PCM, 0.0)?;
    assert_eq!(h.encoder.gate_state(), GateState::Started);
    h.encoder.encode_video_frame(&frame(0.2), 0.2)?;

    let summary = h.encoder.finalize_encoding()?;
    assert_eq!(summary.video.chunks_dropped, 2);
    assert_eq!(summary.video.chunks_written, 1);
    assert_eq!(summary.audio.chunks_written, 1);
    assert_eq!(h.writer.log().written_before_start, 0);
    Ok(())
}

#[test]
fn test_tracks_fed_from_two_threads() -> anyhow::Result<()> {
    let mut video = EncoderScript::new(TrackKind::Video);
    video.announce_after_inputs = 3;
    let mut audio = EncoderScript::new(TrackKind::Audio);
    audio.announce_after_inputs = 3;
    let writer = RecordingWriter::default().with_start_delay(Duration::from_millis(20));
    let h = harness(video, audio, writer);
    h.encoder.prepare()?;

    std::thread::scope(|s| {
        let video = s.spawn(|| -> crate::Result<()> {
            for i in 0..30 {
                let t = i as f64 / 30.0;
                h.encoder.encode_video_frame(&frame(t), t)?;
            }
            Ok(())
        });
        let audio = s.spawn(|| -> crate::Result<()> {
            for i in 0..40 {
                h.encoder.encode_audio_buffer(&PCM, i as f64 * 0.023)?;
            }
            Ok(())
        });
        video.join().expect("video thread").and(audio.join().expect("audio thread"))
    })?;

    let summary = h.encoder.finalize_encoding()?;
    let log = h.writer.log();
    assert_eq!(log.start_calls, 1);
    assert_eq!(log.written_before_start, 0);
    assert_eq!(summary.video.chunks_written + summary.video.chunks_dropped, 30);
    assert_eq!(summary.audio.chunks_written + summary.audio.chunks_dropped, 40);
    Ok(())
}

#[test]
fn test_fatal_error_poisons_encoder() {
    let mut video = EncoderScript::new(TrackKind::Video);
    video.announce_twice = true;
    let h = harness(video, EncoderScript::new(TrackKind::Audio), RecordingWriter::default());

    let err = h.encoder.prepare().unwrap_err();
    assert!(matches!(err, ComposeError::DuplicateFormat { kind: TrackKind::Video }), "{}", err);
    assert_eq!(h.encoder.gate_state(), GateState::Aborted);
    assert!(matches!(h.encoder.encode_audio_buffer(&PCM, 0.0), Err(ComposeError::InvalidState(_))));
    assert!(matches!(h.encoder.finalize_encoding(), Err(ComposeError::InvalidState(_))));

    h.encoder.release();
    let log = h.writer.log();
    assert_eq!((log.start_calls, log.stop_calls, log.release_calls), (0, 0, 1));
}

#[test]
fn test_writer_start_failure_is_fatal() {
    let h = harness(
        EncoderScript::new(TrackKind::Video),
        EncoderScript::new(TrackKind::Audio),
        RecordingWriter::default().failing_start(),
    );
    let err = h.encoder.prepare().unwrap_err();
    assert!(matches!(err, ComposeError::Writer(_)), "{}", err);
    assert_eq!(h.encoder.gate_state(), GateState::Aborted);
}

#[test]
fn test_release_twice() {
    let h = harness(
        EncoderScript::new(TrackKind::Video),
        EncoderScript::new(TrackKind::Audio),
        RecordingWriter::default(),
    );
    h.encoder.prepare().expect("prepare");
    h.encoder.release();
    h.encoder.release();

    assert!(matches!(
        h.encoder.encode_video_frame(&frame(0.0), 0.0),
        Err(ComposeError::InvalidState(_))
    ));
    let log = h.writer.log();
    assert_eq!((log.stop_calls, log.release_calls), (1, 1));
    assert!(h.video.probe().surface_released);
    assert_eq!(h.video.probe().release_calls, 1);

    drop(h);
}
