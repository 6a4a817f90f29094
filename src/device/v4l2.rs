//! V4L2 capture device.
//!
//! Opening, capability query and format negotiation go through the `v4l`
//! crate. The streaming buffer protocol and input switching are issued as raw
//! `VIDIOC_*` ioctls through `v4l::v4l2`, because the pool has to own each
//! buffer individually instead of handing control to `MmapStream`.

use std::io;
use std::mem;
use std::os::raw::c_void;
use std::os::unix::fs::FileTypeExt;
use std::os::unix::io::RawFd;
use std::ptr;
use std::time::Duration;

use v4l::buffer::Type;
use v4l::capability::Flags;
use v4l::memory::Memory;
use v4l::v4l2;
use v4l::v4l_sys::{v4l2_buffer, v4l2_crop, v4l2_cropcap, v4l2_input, v4l2_requestbuffers};
use v4l::video::Capture;
use v4l::{Device, FourCC};

use super::{
    check_buffer_timestamps, CaptureDevice, DequeuedBuffer, FieldOrder, MappedRegion,
    NegotiatedFormat, PixelFormat, StampSource, VideoStandard,
};
use crate::error::{is_would_block, retry_interrupted, Result, UnmixError};
use crate::scheduler::Source;
use crate::Timestamp;

const V4L2_INPUT_TYPE_TUNER: u32 = 1;
const V4L2_INPUT_TYPE_CAMERA: u32 = 2;

/// Issue a `VIDIOC_*` request, retrying on `EINTR`. The request name doubles
/// as the operation name in errors.
macro_rules! xioctl {
    ($fd:expr, $request:ident, $arg:expr) => {
        retry_interrupted(|| unsafe {
            v4l2::ioctl($fd, v4l2::vidioc::$request, $arg as *mut _ as *mut c_void)
        })
        .map_err(|err| UnmixError::device(stringify!($request), err))
    };
}

/// One buffer mapped with `mmap(2)`; unmapped on drop.
pub struct MmapRegion {
    ptr: *mut c_void,
    len: usize,
}

impl MappedRegion for MmapRegion {
    fn len(&self) -> usize {
        self.len
    }

    fn with_bytes<R>(&self, len: usize, f: impl FnOnce(&[u8]) -> R) -> R {
        let len = len.min(self.len);
        // SAFETY: the mapping stays valid until drop; the pool only reads a
        // region while it holds the buffer's `FilledBuffer` token, so the
        // driver does not write to it concurrently.
        let bytes = unsafe { std::slice::from_raw_parts(self.ptr as *const u8, len) };
        f(bytes)
    }
}

impl Drop for MmapRegion {
    fn drop(&mut self) {
        if let Err(err) = unsafe { v4l2::munmap(self.ptr, self.len) } {
            log::warn!("munmap of {} bytes failed: {}", self.len, err);
        }
    }
}

pub struct V4l2Capture {
    path: String,
    device: Device,
    fd: RawFd,
    stamp_source: Option<StampSource>,
}

impl V4l2Capture {
    pub fn open(path: &str) -> Result<Self> {
        let meta = std::fs::metadata(path).map_err(|err| UnmixError::device("stat", err))?;
        if !meta.file_type().is_char_device() {
            return Err(UnmixError::NotAV4l2Device(path.to_string()));
        }
        let device = Device::with_path(path).map_err(|err| UnmixError::device("open", err))?;
        let fd = device.handle().fd();
        Ok(Self {
            path: path.to_string(),
            device,
            fd,
            stamp_source: None,
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn configure(
        &mut self,
        sources: &[Source],
        default_standard: VideoStandard,
        format: &PixelFormat,
    ) -> Result<NegotiatedFormat> {
        self.check_capabilities()?;

        let mut negotiated: Option<NegotiatedFormat> = None;
        // End-of-frame timestamps put a frame that began before a switch
        // after the switch, so allow one frame of the slowest standard.
        let mut min_settle = Duration::ZERO;
        for source in sources {
            let name = self.enumerate_input(source.input)?;
            self.select_input(source.input)?;
            let standard = source.standard.unwrap_or(default_standard);
            self.set_standard(standard)?;
            min_settle = min_settle.max(standard.frame_interval());
            self.reset_crop();
            let result = self.set_format(format)?;
            log::info!(
                "Format for input {}:{} will be {}, frame with {} bytes.",
                source.input,
                name,
                result.format,
                result.frame_size
            );
            negotiated = Some(result);
        }
        negotiated
            .map(|n| NegotiatedFormat { min_settle, ..n })
            .ok_or_else(|| UnmixError::Config("should specify at least one input".into()))
    }

    fn check_capabilities(&self) -> Result<()> {
        let caps = self.device.query_caps().map_err(|err| {
            if err.raw_os_error() == Some(libc::EINVAL) {
                UnmixError::NotAV4l2Device(self.path.clone())
            } else {
                UnmixError::device("VIDIOC_QUERYCAP", err)
            }
        })?;
        if !caps.capabilities.contains(Flags::VIDEO_CAPTURE) {
            return Err(UnmixError::NotACaptureDevice(self.path.clone()));
        }
        if !caps.capabilities.contains(Flags::STREAMING) {
            return Err(UnmixError::StreamingUnsupported(self.path.clone()));
        }
        log::info!("{}: {} ({})", self.path, caps.card, caps.driver);
        Ok(())
    }

    fn enumerate_input(&self, index: u32) -> Result<String> {
        let mut input: v4l2_input = unsafe { mem::zeroed() };
        input.index = index;
        retry_interrupted(|| unsafe {
            v4l2::ioctl(
                self.fd,
                v4l2::vidioc::VIDIOC_ENUMINPUT,
                &mut input as *mut _ as *mut c_void,
            )
        })
        .map_err(|source| UnmixError::UnknownInput {
            input: index,
            source,
        })?;

        let end = input.name.iter().position(|&b| b == 0).unwrap_or(input.name.len());
        let name = String::from_utf8_lossy(&input.name[..end]).into_owned();
        if input.type_ & V4L2_INPUT_TYPE_TUNER != 0 {
            log::info!("Input {}:{} is a TUNER.", index, name);
        }
        if input.type_ & V4L2_INPUT_TYPE_CAMERA != 0 {
            log::info!("Input {}:{} is a CAMERA.", index, name);
        }
        Ok(name)
    }

    /// Reset cropping to the default rectangle. Drivers without cropping
    /// support reject this, which is fine.
    fn reset_crop(&self) {
        let mut cropcap: v4l2_cropcap = unsafe { mem::zeroed() };
        cropcap.type_ = Type::VideoCapture as u32;
        if xioctl!(self.fd, VIDIOC_CROPCAP, &mut cropcap).is_err() {
            return;
        }
        let mut crop: v4l2_crop = unsafe { mem::zeroed() };
        crop.type_ = Type::VideoCapture as u32;
        crop.c = cropcap.defrect;
        if let Err(err) = xioctl!(self.fd, VIDIOC_S_CROP, &mut crop) {
            log::warn!("{}: cropping not supported: {}", self.path, err);
        }
    }

    fn set_format(&self, requested: &PixelFormat) -> Result<NegotiatedFormat> {
        let mut fmt = Capture::format(&self.device)
            .map_err(|err| UnmixError::device("VIDIOC_G_FMT", err))?;
        fmt.width = requested.width;
        fmt.height = requested.height;
        fmt.fourcc = FourCC::new(&requested.fourcc);
        fmt.field_order = field_order(requested.field);

        let fmt = Capture::set_format(&self.device, &fmt)
            .map_err(|err| UnmixError::device("VIDIOC_S_FMT", err))?;
        let negotiated = PixelFormat {
            width: fmt.width,
            height: fmt.height,
            fourcc: fmt.fourcc.repr,
            field: requested.field,
        };
        if negotiated.width != requested.width
            || negotiated.height != requested.height
            || negotiated.fourcc != requested.fourcc
        {
            return Err(UnmixError::FormatRejected {
                device: self.path.clone(),
                requested: requested.to_string(),
                negotiated: negotiated.to_string(),
            });
        }
        Ok(NegotiatedFormat {
            format: negotiated,
            frame_size: fmt.size as usize,
            min_settle: Duration::ZERO,
        })
    }

    fn buffer_desc(index: u32) -> v4l2_buffer {
        let mut buf: v4l2_buffer = unsafe { mem::zeroed() };
        buf.index = index;
        buf.type_ = Type::VideoCapture as u32;
        buf.memory = Memory::Mmap as u32;
        buf
    }

    fn request(&mut self, count: u32) -> Result<u32> {
        let mut req: v4l2_requestbuffers = unsafe { mem::zeroed() };
        req.count = count;
        req.type_ = Type::VideoCapture as u32;
        req.memory = Memory::Mmap as u32;
        xioctl!(self.fd, VIDIOC_REQBUFS, &mut req)?;
        Ok(req.count)
    }
}

pub(crate) fn field_order(field: FieldOrder) -> v4l::format::FieldOrder {
    use v4l::format::FieldOrder as V4lField;
    match field {
        FieldOrder::Any => V4lField::Any,
        FieldOrder::Progressive => V4lField::Progressive,
        FieldOrder::Interlaced => V4lField::Interlaced,
        FieldOrder::InterlacedTb => V4lField::InterlacedTB,
        FieldOrder::InterlacedBt => V4lField::InterlacedBT,
        FieldOrder::Alternate => V4lField::Alternate,
    }
}

impl CaptureDevice for V4l2Capture {
    type Region = MmapRegion;

    fn request_buffers(&mut self, count: u32) -> Result<u32> {
        self.request(count)
    }

    fn map_buffer(&mut self, index: u32) -> Result<MmapRegion> {
        let mut buf = Self::buffer_desc(index);
        xioctl!(self.fd, VIDIOC_QUERYBUF, &mut buf)?;
        let len = buf.length as usize;
        let offset = unsafe { buf.m.offset };
        let ptr = unsafe {
            v4l2::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                self.fd,
                offset as libc::off_t,
            )
        }
        .map_err(|source| UnmixError::Map { index, source })?;
        Ok(MmapRegion { ptr, len })
    }

    fn free_buffers(&mut self) -> Result<()> {
        self.request(0).map(|_| ())
    }

    fn queue_buffer(&mut self, index: u32) -> Result<()> {
        let mut buf = Self::buffer_desc(index);
        xioctl!(self.fd, VIDIOC_QBUF, &mut buf)
    }

    fn dequeue_buffer(&mut self) -> Result<Option<DequeuedBuffer>> {
        let mut buf = Self::buffer_desc(0);
        let res = retry_interrupted(|| unsafe {
            v4l2::ioctl(
                self.fd,
                v4l2::vidioc::VIDIOC_DQBUF,
                &mut buf as *mut _ as *mut c_void,
            )
        });
        match res {
            Ok(()) => {
                let source = check_buffer_timestamps(&self.path, buf.flags)?;
                if self.stamp_source != Some(source) {
                    log::info!("{}: buffer timestamps taken at {:?}", self.path, source);
                    self.stamp_source = Some(source);
                }
                Ok(Some(DequeuedBuffer {
                    index: buf.index,
                    bytes_used: buf.bytesused as usize,
                    captured_at: Timestamp::from_timeval(
                        buf.timestamp.tv_sec as i64,
                        buf.timestamp.tv_usec as i64,
                    ),
                }))
            }
            Err(err) if is_would_block(&err) => Ok(None),
            Err(err) => Err(UnmixError::device("VIDIOC_DQBUF", err)),
        }
    }

    fn wait_ready(&mut self, timeout: Duration) -> Result<bool> {
        let mut pfd = libc::pollfd {
            fd: self.fd,
            events: libc::POLLIN,
            revents: 0,
        };
        let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as libc::c_int;
        let ready = retry_interrupted(|| {
            let rc = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
            if rc == -1 {
                Err(io::Error::last_os_error())
            } else {
                Ok(rc)
            }
        })
        .map_err(|err| UnmixError::device("poll", err))?;
        Ok(ready > 0)
    }

    fn select_input(&mut self, input: u32) -> Result<()> {
        let mut index = input as libc::c_int;
        xioctl!(self.fd, VIDIOC_S_INPUT, &mut index)
    }

    fn set_standard(&mut self, standard: VideoStandard) -> Result<()> {
        let mut id: u64 = standard.id();
        xioctl!(self.fd, VIDIOC_S_STD, &mut id)
    }

    fn stream_on(&mut self) -> Result<()> {
        let mut ty = Type::VideoCapture as libc::c_int;
        xioctl!(self.fd, VIDIOC_STREAMON, &mut ty)
    }

    fn stream_off(&mut self) -> Result<()> {
        let mut ty = Type::VideoCapture as libc::c_int;
        xioctl!(self.fd, VIDIOC_STREAMOFF, &mut ty)
    }

    fn now(&mut self) -> Timestamp {
        Timestamp::monotonic_now()
    }
}
