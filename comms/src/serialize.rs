use std::io;

/// Types that can be written as the body of a framed message.
pub trait Serialize<'a> {
    /// Writes the owned part of `self` into `buf`.
    ///
    /// # Returns
    /// An optional borrowed tail that is written right after `buf` without copying.
    fn serialize(&'a self, buf: &mut Vec<u8>) -> io::Result<Option<&'a [u8]>>;
}
