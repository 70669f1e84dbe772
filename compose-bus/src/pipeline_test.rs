use std::{sync::Arc, time::Duration};

use crate::{
    encoder::{AudioSettings, VideoSettings},
    error::ComposeError,
    frame::VideoFrame,
    mux_gate::{GateState, MuxGate},
    pipeline::{AudioEncodePipeline, PipelinePhase, VideoEncodePipeline},
    render::SoftwareRenderer,
    stream::TrackKind,
    testing::{EncoderProbeHandle, EncoderScript, RecordingWriter, ScriptedEncoder},
};

const PCM: [u8; 64] = [0u8; 64];

fn gate(writer: &RecordingWriter, held_per_track: usize) -> Arc<MuxGate> {
    Arc::new(MuxGate::new(Box::new(writer.clone()), held_per_track))
}

fn audio_pipeline(script: EncoderScript, gate: &Arc<MuxGate>) -> (AudioEncodePipeline, EncoderProbeHandle) {
    let encoder = ScriptedEncoder::new(script);
    let probe = encoder.probe_handle();
    let pipeline = AudioEncodePipeline::new(
        Box::new(encoder),
        AudioSettings::default(),
        gate.clone(),
        Duration::from_millis(1),
    );
    (pipeline, probe)
}

fn video_pipeline(script: EncoderScript, gate: &Arc<MuxGate>) -> (VideoEncodePipeline, EncoderProbeHandle) {
    let encoder = ScriptedEncoder::new(script);
    let probe = encoder.probe_handle();
    let settings = VideoSettings {
        width: 8,
        height: 8,
        ..Default::default()
    };
    let pipeline = VideoEncodePipeline::new(
        Box::new(encoder),
        Box::new(SoftwareRenderer),
        settings,
        gate.clone(),
        Duration::from_millis(1),
    );
    (pipeline, probe)
}

/// Both tracks prepared, registered and the writer started.
fn started_pair(
    writer: &RecordingWriter,
    audio: EncoderScript,
) -> anyhow::Result<(Arc<MuxGate>, VideoEncodePipeline, AudioEncodePipeline, EncoderProbeHandle)> {
    let gate = gate(writer, 0);
    let (mut video, _) = video_pipeline(EncoderScript::new(TrackKind::Video), &gate);
    let (mut audio, probe) = audio_pipeline(audio, &gate);
    video.prepare()?;
    video.drain()?;
    audio.prepare()?;
    audio.drain()?;
    assert_eq!(gate.state(), GateState::Started);
    Ok((gate, video, audio, probe))
}

#[test]
fn test_late_registration_starts_writer_once() -> anyhow::Result<()> {
    let writer = RecordingWriter::default();
    let gate = gate(&writer, 0);
    let (mut audio, _) = audio_pipeline(EncoderScript::new(TrackKind::Audio), &gate);
    let mut script = EncoderScript::new(TrackKind::Video);
    script.announce_after_inputs = 2;
    let (mut video, _) = video_pipeline(script, &gate);

    audio.prepare()?;
    audio.drain()?;
    assert_eq!(gate.state(), GateState::PartiallyRegistered);
    assert_eq!(audio.track().state().track_index, Some(0));

    // Audio output before the writer starts is lost.
    audio.encode_buffer(&PCM, 0)?;
    assert_eq!(audio.track().stats().chunks_dropped, 1);

    video.prepare()?;
    video.encode_frame(&VideoFrame::blank(2, 2, 0), 0)?;
    assert!(!gate.is_started());
    video.encode_frame(&VideoFrame::blank(2, 2, 33_333), 33_333)?;
    assert!(gate.is_started());

    let log = writer.log();
    assert_eq!(log.start_calls, 1);
    assert_eq!(log.tracks, vec![TrackKind::Audio, TrackKind::Video]);
    assert_eq!(log.written_before_start, 0);
    let video_pts: Vec<i64> = log.writes.iter().filter(|w| w.track_index == 1).map(|w| w.pts_us).collect();
    assert_eq!(video_pts, vec![0, 33_333]);
    assert_eq!(video.track().stats().chunks_written, 2);
    Ok(())
}

#[test]
fn test_second_format_announcement_aborts() -> anyhow::Result<()> {
    let writer = RecordingWriter::default();
    let gate = gate(&writer, 0);
    let mut script = EncoderScript::new(TrackKind::Audio);
    script.announce_twice = true;
    let (mut audio, _) = audio_pipeline(script, &gate);

    audio.prepare()?;
    let err = audio.drain().unwrap_err();
    assert!(matches!(err, ComposeError::DuplicateFormat { kind: TrackKind::Audio }), "{}", err);
    assert_eq!(audio.track().phase(), PipelinePhase::Aborted);
    assert_eq!(gate.state(), GateState::Aborted);
    assert!(matches!(audio.encode_buffer(&PCM, 0), Err(ComposeError::InvalidState(_))));
    Ok(())
}

#[test]
fn test_codec_config_is_not_written() -> anyhow::Result<()> {
    let writer = RecordingWriter::default();
    let mut script = EncoderScript::new(TrackKind::Audio);
    script.codec_config_chunk = true;
    let (_gate, _video, mut audio, probe) = started_pair(&writer, script)?;

    assert!(writer.log().writes.is_empty());
    assert_eq!(probe.probe().released_slots, vec![0]);
    assert_eq!(probe.outstanding_slots(), 0);

    audio.encode_buffer(&PCM, 0)?;
    let log = writer.log();
    assert_eq!(log.writes.len(), 1);
    assert_eq!(log.writes[0].len, 16);
    assert_eq!(probe.outstanding_slots(), 0);
    Ok(())
}

#[test]
fn test_pre_start_chunks_held_up_to_limit() -> anyhow::Result<()> {
    let writer = RecordingWriter::default();
    let gate = gate(&writer, 2);
    let (mut audio, _) = audio_pipeline(EncoderScript::new(TrackKind::Audio), &gate);
    let (mut video, _) = video_pipeline(EncoderScript::new(TrackKind::Video), &gate);

    audio.prepare()?;
    for pts in [0, 10_000, 20_000] {
        audio.encode_buffer(&PCM, pts)?;
    }
    let stats = audio.track().stats().clone();
    assert_eq!((stats.chunks_buffered, stats.chunks_dropped), (2, 1));
    assert!(writer.log().writes.is_empty());

    video.prepare()?;
    video.drain()?;
    let log = writer.log();
    assert_eq!(log.start_calls, 1);
    assert_eq!(log.written_before_start, 0);
    let flushed: Vec<(usize, i64)> = log.writes.iter().map(|w| (w.track_index, w.pts_us)).collect();
    assert_eq!(flushed, vec![(0, 0), (0, 10_000)]);
    Ok(())
}

#[test]
fn test_finalize_drains_to_end_of_stream() -> anyhow::Result<()> {
    let writer = RecordingWriter::default();
    let (_gate, _video, mut audio, probe) = started_pair(&writer, EncoderScript::new(TrackKind::Audio))?;

    audio.encode_buffer(&PCM, 0)?;
    audio.encode_buffer(&PCM, 23_219)?;
    audio.finalize()?;

    assert_eq!(audio.track().phase(), PipelinePhase::Finished);
    assert!(probe.probe().end_signaled);
    assert!(!audio.track().stats().early_end);
    assert_eq!(audio.track().stats().chunks_written, 2);
    assert!(audio.track().state().info.is_end_of_stream());
    assert_eq!(probe.outstanding_slots(), 0);

    // A second finalize is a no-op.
    audio.finalize()?;
    Ok(())
}

#[test]
fn test_early_end_of_stream_is_tolerated() -> anyhow::Result<()> {
    let writer = RecordingWriter::default();
    let mut script = EncoderScript::new(TrackKind::Audio);
    script.early_end_after = Some(1);
    let (_gate, _video, mut audio, probe) = started_pair(&writer, script)?;

    audio.encode_buffer(&PCM, 0)?;
    assert!(audio.track().stats().early_end);

    audio.finalize()?;
    assert!(!probe.probe().end_signaled);
    assert_eq!(audio.track().phase(), PipelinePhase::Finished);
    assert_eq!(audio.track().stats().chunks_written, 1);
    Ok(())
}

#[test]
fn test_busy_encoder_input_is_retried_once() -> anyhow::Result<()> {
    let writer = RecordingWriter::default();
    let mut script = EncoderScript::new(TrackKind::Audio);
    script.busy_inputs = 1;
    let (_gate, _video, mut audio, probe) = started_pair(&writer, script)?;
    audio.encode_buffer(&PCM, 0)?;
    assert_eq!(probe.probe().inputs, vec![0]);
    assert_eq!(audio.track().stats().inputs_dropped, 0);

    let writer = RecordingWriter::default();
    let mut script = EncoderScript::new(TrackKind::Audio);
    script.busy_inputs = 2;
    let (_gate, _video, mut audio, probe) = started_pair(&writer, script)?;
    audio.encode_buffer(&PCM, 0)?;
    assert!(probe.probe().inputs.is_empty());
    assert_eq!(audio.track().stats().inputs_dropped, 1);
    Ok(())
}

#[test]
fn test_release_after_failed_prepare() {
    let writer = RecordingWriter::default();
    let gate = gate(&writer, 0);
    let mut script = EncoderScript::new(TrackKind::Audio);
    script.fail_configure = true;
    let (mut audio, probe) = audio_pipeline(script, &gate);

    let err = audio.prepare().unwrap_err();
    assert!(matches!(err, ComposeError::Encoder { kind: TrackKind::Audio, .. }), "{}", err);

    audio.release();
    audio.release();
    let probe = probe.probe();
    assert_eq!(probe.release_calls, 1);
    assert!(!probe.stopped);
}

#[test]
fn test_video_release_frees_surface_and_encoder() -> anyhow::Result<()> {
    let writer = RecordingWriter::default();
    let gate = gate(&writer, 0);
    let (mut video, probe) = video_pipeline(EncoderScript::new(TrackKind::Video), &gate);

    assert!(matches!(
        video.encode_frame(&VideoFrame::blank(2, 2, 0), 0),
        Err(ComposeError::InvalidState(_))
    ));

    video.prepare()?;
    video.encode_frame(&VideoFrame::blank(2, 2, 0), 0)?;
    video.release();
    video.release();

    let state = probe.probe();
    assert!(state.surface_released);
    assert!(state.stopped);
    assert_eq!(state.release_calls, 1);
    assert_eq!(state.inputs, vec![0]);
    assert_eq!(video.track().phase(), PipelinePhase::Released);
    assert!(matches!(
        video.encode_frame(&VideoFrame::blank(2, 2, 1), 1),
        Err(ComposeError::InvalidState(_))
    ));
    Ok(())
}
