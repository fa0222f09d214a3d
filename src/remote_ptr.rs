use std::{
    cmp::Ordering,
    fmt::{self, Display, Formatter},
    marker::PhantomData,
    mem::size_of,
    ops::{Add, Sub},
};

/// Untyped tracee memory; arithmetic on it is bytewise.
pub type Void = u8;

/// An address in the recorded process, as stored in raw-data and mapping
/// records. Never dereferenced by us.
#[derive(Hash, Debug)]
pub struct RemotePtr<T> {
    addr: usize,
    phantom: PhantomData<*const T>,
}

// Derives would demand `T: Clone` etc.
impl<T> Clone for RemotePtr<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for RemotePtr<T> {}

impl<T> Default for RemotePtr<T> {
    fn default() -> Self {
        RemotePtr::at(0)
    }
}

impl<T> RemotePtr<T> {
    fn at(addr: usize) -> RemotePtr<T> {
        RemotePtr {
            addr,
            phantom: PhantomData,
        }
    }

    pub fn as_usize(&self) -> usize {
        self.addr
    }
}

impl<T> From<u64> for RemotePtr<T> {
    fn from(addr: u64) -> Self {
        RemotePtr::at(addr as usize)
    }
}

impl<T> Display for RemotePtr<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.addr)
    }
}

/// Advance by `n` elements of `T`.
impl<T> Add<usize> for RemotePtr<T> {
    type Output = Self;

    fn add(self, n: usize) -> Self {
        RemotePtr::at(self.addr + n * size_of::<T>())
    }
}

impl<T> Sub<usize> for RemotePtr<T> {
    type Output = Self;

    fn sub(self, n: usize) -> Self {
        RemotePtr::at(self.addr - n * size_of::<T>())
    }
}

/// Distance in bytes between two pointers.
impl<T> Sub<RemotePtr<T>> for RemotePtr<T> {
    type Output = usize;

    fn sub(self, rhs: RemotePtr<T>) -> usize {
        self.addr - rhs.addr
    }
}

impl<T> PartialEq for RemotePtr<T> {
    fn eq(&self, other: &Self) -> bool {
        self.addr == other.addr
    }
}

impl<T> Eq for RemotePtr<T> {}

impl<T> PartialOrd for RemotePtr<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for RemotePtr<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.addr.cmp(&other.addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_zero() {
        assert_eq!(0, RemotePtr::<Void>::default().as_usize());
    }

    #[test]
    fn arithmetic_scales_by_element_size() {
        let a = RemotePtr::<u64>::from(0x100u64);
        assert_eq!(0x108, (a + 1usize).as_usize());
        assert_eq!(0xf8, (a - 1usize).as_usize());
    }

    #[test]
    fn void_arithmetic_is_bytewise() {
        let a = RemotePtr::<Void>::from(0x1000u64);
        let b = a + 0x20usize;
        assert_eq!(0x20, b - a);
        assert_eq!(a, b - 0x20usize);
    }

    #[test]
    fn ordering_and_display() {
        let a = RemotePtr::<Void>::from(0x1000u64);
        let b = RemotePtr::<Void>::from(0x2000u64);
        assert!(a < b);
        assert_eq!("0x1000", a.to_string());
    }
}
