/// Helper macro for locking items, mapping poisoning to [`crate::Error::LockError`]
///
/// ```rust, ignore
///  let mut data = lock!(my_mutex);
///  data.some_field = 42;
/// ```
macro_rules! lock {
    ($lock:expr) => {
        $lock.lock().map_err(|_| crate::Error::LockError)?
    };
}

/// Checks that a bounded window can serve `$count` more bytes, returning
/// [`crate::Error::EndOfStream`] otherwise.
///
/// ```rust, ignore
///  ensure_can_read!(self, 4);
/// ```
macro_rules! ensure_can_read {
    ($reader:expr, $count:expr) => {
        if !$reader.can_read($count) {
            return Err(crate::Error::EndOfStream {
                relative_offset: $reader.relative_offset(),
                requested: u64::from($count),
                length: u64::from($reader.length()),
            });
        }
    };
}
