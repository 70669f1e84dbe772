//! Hardware encoder discovery with software fallback.

use ffmpeg_next::format::Pixel;

/// Software encoder used for a codec name when no hardware encoder opens.
pub fn software_encoder_name(codec: &str) -> &str {
    match codec {
        "h264" | "avc" => "libx264",
        "hevc" | "h265" => "libx265",
        "vp9" => "libvpx-vp9",
        "av1" => "libaom-av1",
        other => other,
    }
}

/// First available hardware encoder for `codec`, if any.
pub fn find_hw_encoder(codec: &str) -> Option<ffmpeg_next::Codec> {
    let hw_names: &[&str] = match codec {
        "libx264" | "h264" | "avc" => &["h264_nvenc", "h264_vaapi", "h264_qsv", "h264_v4l2m2m"],
        "libx265" | "hevc" | "h265" => &["hevc_nvenc", "hevc_vaapi", "hevc_qsv", "hevc_v4l2m2m"],
        "libvpx-vp9" | "vp9" => &["vp9_vaapi", "vp9_qsv"],
        "libaom-av1" | "libsvtav1" | "av1" => &["av1_nvenc", "av1_vaapi", "av1_qsv"],
        _ => &[],
    };

    for name in hw_names {
        if let Some(codec) = ffmpeg_next::encoder::find_by_name(name) {
            log::info!("found hardware encoder: {}", name);
            return Some(codec);
        }
    }
    None
}

/// Input pixel format for an encoder. Hardware encoders commonly prefer NV12.
pub fn pixel_format_for_encoder(encoder_name: &str) -> Pixel {
    let is_hw = ["nvenc", "vaapi", "qsv", "v4l2m2m"]
        .iter()
        .any(|suffix| encoder_name.contains(suffix));
    if is_hw { Pixel::NV12 } else { Pixel::YUV420P }
}
