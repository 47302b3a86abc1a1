use std::io;

/// Types that can be read back from the body of a framed message.
pub trait Deserialize<'a>: Sized {
    fn deserialize(buf: &'a mut [u8]) -> io::Result<Self>;
}
