/// Element type of a receive buffer whose storage is aligned for `f32`, so a
/// gradient frame can be viewed in place without copying.
pub trait Align4: bytemuck::Pod {}

impl Align4 for u32 {}
impl Align4 for u64 {}
impl Align4 for f32 {}
impl Align4 for f64 {}
