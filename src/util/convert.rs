
pub trait SafeCast<T> {
    fn safe_cast(self) -> T;
}

#[cfg(not(target_pointer_width = "16"))]
impl SafeCast<usize> for u32 {
    fn safe_cast(self) -> usize {
        self as usize
    }
}

#[cfg(not(target_pointer_width = "16"))]
impl SafeCast<usize> for u16 {
    fn safe_cast(self) -> usize {
        self as usize
    }
}

impl SafeCast<u64> for u32 {
    fn safe_cast(self) -> u64 {
        self as u64
    }
}


/// For narrowing casts where business logic ensures that the value is in the narrower type's range.
/// NB: The implementations will panic otherwise
pub trait PrecheckedCast<T> {
    fn prechecked_cast(self) -> T;
}
impl PrecheckedCast<i32> for usize {
    fn prechecked_cast(self) -> i32 {
        self.try_into().expect("this is a bug: application logic should have ensured the value range")
    }
}
impl PrecheckedCast<u16> for usize {
    fn prechecked_cast(self) -> u16 {
        self.try_into().expect("this is a bug: application logic should have ensured the value range")
    }
}
impl PrecheckedCast<usize> for i32 {
    fn prechecked_cast(self) -> usize {
        self.try_into().expect("this is a bug: application logic should have ensured the value range")
    }
}
