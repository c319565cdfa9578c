//! Data sources: lazy producers of PCM frames.
//!
//! A [`DataSource`] is anything that can fill a buffer with PCM frames in
//! its declared native format: a decoder, a generator, a capture tap. The
//! engine never knows what is behind the trait; when a consumer needs a
//! different format it inserts a data converter at the boundary.
//!
//! Only [`read_pcm_frames`](DataSource::read_pcm_frames) is mandatory.
//! Seeking, cursor and length queries are capabilities a source may decline
//! with [`Error::InvalidOperation`], which is also the default.
//!
//! [`LoopingSource`] and [`ChainedSource`] are composition layers:
//! the former wraps reads at a loop point, the latter splices several
//! sources into one stream.

#[cfg(not(feature = "std"))]
use alloc::{boxed::Box, vec::Vec};

use crate::channel::ChannelMap;
use crate::format::SampleFormat;
use crate::result::{Error, Result};

/// The native format a data source produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceFormat {
    /// Sample format of the produced frames.
    pub format: SampleFormat,
    /// Channel count.
    pub channels: u16,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Speaker layout of the channels.
    pub channel_map: ChannelMap,
}

impl SourceFormat {
    /// An `f32` format with the standard channel map for `channels`.
    pub fn f32(channels: u16, sample_rate: u32) -> Result<Self> {
        Ok(Self {
            format: SampleFormat::F32,
            channels,
            sample_rate,
            channel_map: ChannelMap::standard(channels)?,
        })
    }

    /// Size of one frame in bytes.
    pub fn bytes_per_frame(&self) -> usize {
        self.format.bytes_per_frame(self.channels)
    }
}

/// A lazy, possibly finite, possibly seekable sequence of PCM frames.
///
/// # Read contract
///
/// `read_pcm_frames` fills `dst` with as many whole frames as it can and
/// returns the count, which may be less than requested. [`Error::AtEnd`] is
/// returned **only** when zero frames were produced and no more ever will
/// be; a short read with data is just a short read.
pub trait DataSource: Send {
    /// The native format of the produced frames.
    fn format(&self) -> SourceFormat;

    /// Fills `dst` with up to `dst.len() / bytes_per_frame` frames.
    /// Returns the number of frames produced.
    fn read_pcm_frames(&mut self, dst: &mut [u8]) -> Result<u64>;

    /// Repositions the cursor to an absolute frame index.
    fn seek_to_pcm_frame(&mut self, _frame: u64) -> Result<()> {
        Err(Error::InvalidOperation)
    }

    /// Current cursor position in frames.
    fn cursor_pcm_frames(&self) -> Result<u64> {
        Err(Error::InvalidOperation)
    }

    /// Total length in frames, for finite sources.
    fn length_pcm_frames(&self) -> Result<u64> {
        Err(Error::InvalidOperation)
    }

    /// Clones this source with an independent cursor, when supported.
    /// The backing store may be shared.
    fn try_duplicate(&self) -> Option<Box<dyn DataSource>> {
        None
    }
}

impl<S: DataSource + ?Sized> DataSource for Box<S> {
    fn format(&self) -> SourceFormat {
        (**self).format()
    }

    fn read_pcm_frames(&mut self, dst: &mut [u8]) -> Result<u64> {
        (**self).read_pcm_frames(dst)
    }

    fn seek_to_pcm_frame(&mut self, frame: u64) -> Result<()> {
        (**self).seek_to_pcm_frame(frame)
    }

    fn cursor_pcm_frames(&self) -> Result<u64> {
        (**self).cursor_pcm_frames()
    }

    fn length_pcm_frames(&self) -> Result<u64> {
        (**self).length_pcm_frames()
    }

    fn try_duplicate(&self) -> Option<Box<dyn DataSource>> {
        (**self).try_duplicate()
    }
}

/// Wraps a seekable source and loops reads over a frame range.
///
/// With looping disabled the wrapper is transparent. With looping enabled,
/// reads that hit the loop end (or the source's own end) seek back to the
/// loop begin and keep filling, so the consumer never observes
/// [`Error::AtEnd`].
pub struct LoopingSource<S: DataSource> {
    inner: S,
    looping: bool,
    loop_begin: u64,
    /// Exclusive loop end; `None` means the source's natural end.
    loop_end: Option<u64>,
}

impl<S: DataSource> LoopingSource<S> {
    /// Wraps `inner` with looping disabled.
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            looping: false,
            loop_begin: 0,
            loop_end: None,
        }
    }

    /// Enables or disables looping.
    pub fn set_looping(&mut self, looping: bool) {
        self.looping = looping;
    }

    /// Whether looping is currently enabled.
    pub fn looping(&self) -> bool {
        self.looping
    }

    /// Sets the loop range in frames; `end` is exclusive and `None` means
    /// the source's natural end. `begin >= end` is refused.
    pub fn set_loop_range(&mut self, begin: u64, end: Option<u64>) -> Result<()> {
        if let Some(end) = end
            && begin >= end
        {
            return Err(Error::InvalidArgs);
        }
        self.loop_begin = begin;
        self.loop_end = end;
        Ok(())
    }

    /// The wrapped source.
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// The wrapped source, mutably.
    pub fn inner_mut(&mut self) -> &mut S {
        &mut self.inner
    }
}

impl<S: DataSource> DataSource for LoopingSource<S> {
    fn format(&self) -> SourceFormat {
        self.inner.format()
    }

    fn read_pcm_frames(&mut self, dst: &mut [u8]) -> Result<u64> {
        if !self.looping {
            return self.inner.read_pcm_frames(dst);
        }

        let bpf = self.format().bytes_per_frame();
        let requested = (dst.len() / bpf) as u64;
        let mut produced = 0u64;

        while produced < requested {
            let remaining = requested - produced;
            // Clip the read to the loop end when one is set.
            let chunk = match self.loop_end {
                Some(end) => {
                    let cursor = self.inner.cursor_pcm_frames()?;
                    if cursor >= end {
                        self.inner.seek_to_pcm_frame(self.loop_begin)?;
                        continue;
                    }
                    remaining.min(end - cursor)
                }
                None => remaining,
            };

            let offset = (produced as usize) * bpf;
            let span = &mut dst[offset..offset + (chunk as usize) * bpf];
            match self.inner.read_pcm_frames(span) {
                Ok(0) | Err(Error::AtEnd) => {
                    // Natural end inside the loop body: wrap. An empty loop
                    // region would spin here, so refuse it instead.
                    if self.inner.cursor_pcm_frames()? == self.loop_begin {
                        return Err(Error::InvalidOperation);
                    }
                    self.inner.seek_to_pcm_frame(self.loop_begin)?;
                }
                Ok(n) => produced += n,
                Err(e) => return Err(e),
            }
        }
        Ok(produced)
    }

    fn seek_to_pcm_frame(&mut self, frame: u64) -> Result<()> {
        self.inner.seek_to_pcm_frame(frame)
    }

    fn cursor_pcm_frames(&self) -> Result<u64> {
        self.inner.cursor_pcm_frames()
    }

    fn length_pcm_frames(&self) -> Result<u64> {
        self.inner.length_pcm_frames()
    }
}

/// Splices several same-format sources into one stream.
///
/// Reads drain the current source, then transition to the next;
/// [`Error::AtEnd`] surfaces only after the last source is exhausted.
pub struct ChainedSource {
    sources: Vec<Box<dyn DataSource>>,
    current: usize,
}

impl ChainedSource {
    /// Creates a chain from at least one source. All sources must share the
    /// exact native format; a mismatch is [`Error::InvalidArgs`].
    pub fn new(sources: Vec<Box<dyn DataSource>>) -> Result<Self> {
        let Some(first) = sources.first() else {
            return Err(Error::InvalidArgs);
        };
        let format = first.format();
        if sources.iter().any(|s| s.format() != format) {
            return Err(Error::InvalidArgs);
        }
        Ok(Self {
            sources,
            current: 0,
        })
    }

    /// Index of the source currently being read.
    pub fn current_index(&self) -> usize {
        self.current
    }
}

impl DataSource for ChainedSource {
    fn format(&self) -> SourceFormat {
        self.sources[0].format()
    }

    fn read_pcm_frames(&mut self, dst: &mut [u8]) -> Result<u64> {
        let bpf = self.format().bytes_per_frame();
        let requested = (dst.len() / bpf) as u64;
        let mut produced = 0u64;

        while produced < requested && self.current < self.sources.len() {
            let offset = (produced as usize) * bpf;
            let span = &mut dst[offset..(requested as usize) * bpf];
            match self.sources[self.current].read_pcm_frames(span) {
                Ok(0) | Err(Error::AtEnd) => self.current += 1,
                Ok(n) => produced += n,
                Err(e) => return Err(e),
            }
        }

        if produced == 0 && self.current >= self.sources.len() {
            return Err(Error::AtEnd);
        }
        Ok(produced)
    }

    fn length_pcm_frames(&self) -> Result<u64> {
        let mut total = 0u64;
        for source in &self.sources {
            total += source.length_pcm_frames()?;
        }
        Ok(total)
    }
}
