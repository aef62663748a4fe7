/// Append-only arena with explicit capacity doubling.
///
/// The backing storage is always fully initialized up to `capacity()`, so growth is the only
/// place where memory is (re)allocated. `clear()` keeps the allocation for the next build.
#[derive(Debug, Clone)]
pub struct GrowableBuffer<T: Copy + Default> {
    storage: Vec<T>,
    len: usize,
    num_grows: usize,
}

const MIN_CAPACITY: usize = 16;

impl<T: Copy + Default> GrowableBuffer<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        GrowableBuffer {
            storage: vec![T::default(); capacity.max(MIN_CAPACITY)],
            len: 0,
            num_grows: 0,
        }
    }

    #[inline]
    pub fn push(&mut self, value: T) {
        if self.len == self.storage.len() {
            self.grow();
        }
        self.storage[self.len] = value;
        self.len += 1;
    }

    fn grow(&mut self) {
        let new_capacity = (self.storage.len() * 2).max(MIN_CAPACITY);
        self.storage.resize(new_capacity, T::default());
        self.num_grows += 1;
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    /// How often the storage had to be reallocated since creation.
    pub fn num_grows(&self) -> usize {
        self.num_grows
    }

    pub fn memory_bytes(&self) -> usize {
        self.storage.len() * std::mem::size_of::<T>()
    }

    #[inline]
    pub fn as_slice(&self) -> &[T] {
        &self.storage[..self.len]
    }
}

#[test]
fn growable_buffer_doubles_capacity() {
    let mut buffer = GrowableBuffer::<u32>::with_capacity(16);
    for i in 0..16 {
        buffer.push(i);
    }
    assert_eq!(buffer.capacity(), 16);
    assert_eq!(buffer.num_grows(), 0);

    buffer.push(16);
    assert_eq!(buffer.capacity(), 32);
    assert_eq!(buffer.num_grows(), 1);

    for i in 17..65 {
        buffer.push(i);
    }
    assert_eq!(buffer.capacity(), 128);
    assert_eq!(buffer.num_grows(), 3);
    assert_eq!(buffer.len(), 65);
    assert_eq!(buffer.as_slice()[64], 64);
    assert_eq!(buffer.as_slice().iter().sum::<u32>(), (0..65u32).sum::<u32>());
}

#[test]
fn growable_buffer_clear_keeps_allocation() {
    let mut buffer = GrowableBuffer::<f32>::with_capacity(4);
    for i in 0..100 {
        buffer.push(i as f32);
    }
    let capacity = buffer.capacity();
    assert_eq!(capacity, 128);
    buffer.clear();
    assert!(buffer.is_empty());
    assert_eq!(buffer.capacity(), capacity);
    assert_eq!(buffer.memory_bytes(), capacity * 4);
}
