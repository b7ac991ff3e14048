/// Partition `items` into consecutive batches of at most `limit` elements.
///
/// All batches except possibly the last hold exactly `limit` items, order is
/// preserved, and an empty input produces no batches at all. A `limit` of
/// zero is treated as one.
pub fn split_into_chunks<T: Clone>(items: &[T], limit: usize) -> Vec<Vec<T>> {
    items.chunks(limit.max(1)).map(<[T]>::to_vec).collect()
}
