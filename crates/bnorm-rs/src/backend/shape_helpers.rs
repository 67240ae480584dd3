//! Shared shape helpers used by the normalizer and by devices.

/// Computes `product(dims)` with overflow checking.
pub fn checked_element_count_or_error<E, F>(dims: &[usize], mut on_overflow: F) -> Result<usize, E>
where
    F: FnMut() -> E,
{
    let mut count = 1usize;
    for dim in dims {
        count = count.checked_mul(*dim).ok_or_else(&mut on_overflow)?;
    }
    Ok(count)
}

/// Builds row-major contiguous strides with overflow checking.
pub fn contiguous_strides_or_error<E, F>(
    dims: &[usize],
    mut on_overflow: F,
) -> Result<Vec<usize>, E>
where
    F: FnMut() -> E,
{
    let mut strides = vec![0usize; dims.len()];
    let mut stride = 1usize;
    for axis in (0..dims.len()).rev() {
        strides[axis] = stride;
        stride = stride
            .checked_mul(dims[axis])
            .ok_or_else(&mut on_overflow)?;
    }
    Ok(strides)
}

/// Returns `true` when every axis of `src` is `1` or equal to the matching axis of `dst`.
pub fn is_broadcastable_to(src: &[usize], dst: &[usize]) -> bool {
    src.len() == dst.len()
        && src
            .iter()
            .zip(dst)
            .all(|(&from, &to)| from == 1 || from == to)
}

/// Builds strides that read a same-rank `src` buffer while walking `dst` in row-major order.
///
/// Broadcast axes (`src` extent `1`, `dst` extent greater than `1`) get stride `0`. The first
/// offending axis is reported through `on_mismatch`.
pub fn broadcast_strides_or_error<E, F>(
    src: &[usize],
    dst: &[usize],
    mut on_mismatch: F,
) -> Result<Vec<usize>, E>
where
    F: FnMut(Option<usize>) -> E,
{
    if src.len() != dst.len() {
        return Err(on_mismatch(None));
    }
    let mut strides = contiguous_strides_or_error(src, || on_mismatch(None))?;
    for axis in 0..src.len() {
        if src[axis] == dst[axis] {
            continue;
        }
        if src[axis] != 1 {
            return Err(on_mismatch(Some(axis)));
        }
        strides[axis] = 0;
    }
    Ok(strides)
}
