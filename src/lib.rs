// streaming JPEG loader with suspendable input and ICC profile reassembly
//
// error          error, profile error and warning taxonomy
// source         byte sources: slice, chunked reader, DEFLATE entry, io::Read
// stream_buffer  fixed input buffer with pin/unpin discipline and pushback
// pixel_buffer   caller's output storage, same pin discipline
// driver         source manager hooks: fill, skip, suspend, EOF leniency
// icc            ICC profile reassembly from APP2 markers
// colorspace     colorspace guess, loader overrides, scale selection
// decoder        baseline decompression engine
// session        DecodeSession, LoaderListener, AbortHandle

#![no_std]

extern crate alloc;

#[cfg(any(feature = "std", test))]
extern crate std;

pub mod colorspace;
pub mod decoder;
pub mod driver;
pub mod error;
pub mod icc;
pub mod pixel_buffer;
pub mod session;
pub mod source;
pub mod stream_buffer;

pub use colorspace::ColorSpace;
pub use decoder::{Decompressor, ImageInfo, SavedMarker};
pub use error::{Error, ProfileError, Result, Warning};
pub use icc::read_icc_profile;
pub use session::{AbortHandle, DecodeSession, HeaderOutcome, LoaderListener, LogListener};
pub use source::ByteSource;
pub use stream_buffer::{STREAMBUF_SIZE, StreamBuffer};
