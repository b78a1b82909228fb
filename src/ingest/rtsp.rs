//! RTSP pull over libavformat
//!
//! Opens `rtsp://` sources (or anything else libavformat can demux) with
//! interleaved TCP transport and a socket timeout. Packets of the best video
//! stream are tagged as video; everything else is tagged so the pull source
//! drops it.

use bytes::Bytes;
use ffmpeg_next as ffmpeg;
use ffmpeg_next::format::context::Input;
use ffmpeg_next::media::Type;

use super::pull::{MediaPacket, PullBackend, PullError, PullStream, StreamKind};
use crate::constants::PULL_TIMEOUT;

/// libavformat demuxer backend
#[derive(Debug, Default, Clone, Copy)]
pub struct FfmpegPullBackend;

impl PullBackend for FfmpegPullBackend {
    fn open(&mut self, url: &str) -> Result<Box<dyn PullStream>, PullError> {
        ffmpeg::init().map_err(|e| PullError::Other(format!("FFmpeg init failed: {}", e)))?;
        ffmpeg::format::network::init();

        let mut options = ffmpeg::Dictionary::new();
        options.set("rtsp_transport", "tcp");
        // Microseconds
        options.set("timeout", &PULL_TIMEOUT.as_micros().to_string());

        let input = ffmpeg::format::input_with_dictionary(url, options).map_err(classify)?;
        let video = input.streams().best(Type::Video).map(|stream| stream.index());
        let kinds: Vec<StreamKind> = input
            .streams()
            .map(|stream| kind_of(stream.parameters().medium()))
            .collect();

        tracing::info!("Opened {} ({} streams, video index {:?})", url, kinds.len(), video);
        Ok(Box::new(FfmpegPullStream { input, video, kinds }))
    }
}

struct FfmpegPullStream {
    input: Input,
    video: Option<usize>,
    kinds: Vec<StreamKind>,
}

impl PullStream for FfmpegPullStream {
    fn streams(&self) -> Vec<StreamKind> {
        // Only the selected video stream is reported as video
        self.kinds
            .iter()
            .enumerate()
            .map(|(index, kind)| match kind {
                StreamKind::Video if Some(index) != self.video => StreamKind::Data,
                other => *other,
            })
            .collect()
    }

    fn read_packet(&mut self) -> Result<MediaPacket, PullError> {
        let mut packet = ffmpeg::Packet::empty();
        packet.read(&mut self.input).map_err(classify)?;

        let index = packet.stream();
        let kind = if Some(index) == self.video {
            StreamKind::Video
        } else {
            match self.kinds.get(index) {
                Some(StreamKind::Audio) => StreamKind::Audio,
                _ => StreamKind::Data,
            }
        };

        Ok(MediaPacket {
            kind,
            data: packet.data().map(Bytes::copy_from_slice).unwrap_or_default(),
        })
    }
}

fn kind_of(medium: Type) -> StreamKind {
    match medium {
        Type::Video => StreamKind::Video,
        Type::Audio => StreamKind::Audio,
        _ => StreamKind::Data,
    }
}

/// Map demuxer errors onto the pull error classes
fn classify(e: ffmpeg::Error) -> PullError {
    match e {
        ffmpeg::Error::Eof => PullError::EndOfStream,
        ffmpeg::Error::Other { errno } if errno == libc::EAGAIN => PullError::Again,
        ffmpeg::Error::Other { errno } if errno == libc::ETIMEDOUT => PullError::TimedOut,
        ffmpeg::Error::Other { errno }
            if errno == libc::EIO || errno == libc::ECONNRESET || errno == libc::EPIPE =>
        {
            PullError::Io(e.to_string())
        }
        other => PullError::Other(other.to_string()),
    }
}
