//! Alignment-aware bulk copy into mapped GPU memory.
//!
//! The widest chunk size both pointers are aligned to is used for the bulk of
//! the copy (32, 16, 8, then 4 bytes), with a bytewise tail. Pointers sharing
//! no useful alignment fall back to a plain `copy_nonoverlapping`.

use std::ptr;

/// Copy `src` into `dst`.
///
/// # Safety
/// `dst` must be valid for `src.len()` bytes of writes and must not overlap
/// `src`.
#[inline]
pub unsafe fn copy_to_mapped(dst: *mut u8, src: &[u8]) {
    let len = src.len();
    if len == 0 {
        return;
    }
    let src_ptr = src.as_ptr();
    let shared_alignment = common_alignment(dst as usize, src_ptr as usize);

    let copied = match shared_alignment {
        a if a >= 32 => copy_chunks::<[u128; 2]>(dst, src_ptr, len),
        a if a >= 16 => copy_chunks::<u128>(dst, src_ptr, len),
        a if a >= 8 => copy_chunks::<u64>(dst, src_ptr, len),
        a if a >= 4 => copy_chunks::<u32>(dst, src_ptr, len),
        _ => {
            ptr::copy_nonoverlapping(src_ptr, dst, len);
            return;
        }
    };

    // Bytewise tail.
    for i in copied..len {
        *dst.add(i) = *src_ptr.add(i);
    }
}

/// Largest power of two (capped at 32) dividing both addresses.
fn common_alignment(a: usize, b: usize) -> usize {
    let combined = a | b | 32;
    1 << combined.trailing_zeros()
}

/// Copy as many whole `T` chunks as fit; returns the number of bytes copied.
///
/// # Safety
/// Both pointers must be aligned to `align_of::<T>()` and valid for `len` bytes.
#[inline]
unsafe fn copy_chunks<T: Copy>(dst: *mut u8, src: *const u8, len: usize) -> usize {
    let chunk = std::mem::size_of::<T>();
    let count = len / chunk;
    let dst = dst.cast::<T>();
    let src = src.cast::<T>();
    for i in 0..count {
        ptr::write(dst.add(i), ptr::read(src.add(i)));
    }
    count * chunk
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(C, align(32))]
    struct Aligned([u8; 256]);

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 + 3) as u8).collect()
    }

    #[test]
    fn alignment_detection() {
        assert_eq!(common_alignment(0, 0), 32);
        assert_eq!(common_alignment(64, 16), 16);
        assert_eq!(common_alignment(8, 12), 4);
        assert_eq!(common_alignment(3, 64), 1);
    }

    #[test]
    fn copies_every_length_and_offset() {
        for offset in [0usize, 1, 4, 8, 16] {
            for len in [0usize, 1, 3, 4, 15, 16, 31, 32, 33, 100, 200] {
                let mut dst = Aligned([0; 256]);
                let mut src = Aligned([0; 256]);
                let data = pattern(len);
                src.0[offset..offset + len].copy_from_slice(&data);

                unsafe {
                    copy_to_mapped(
                        dst.0.as_mut_ptr().add(offset),
                        &src.0[offset..offset + len],
                    );
                }

                assert_eq!(&dst.0[offset..offset + len], data.as_slice());
                assert!(dst.0[offset + len..].iter().all(|&b| b == 0));
            }
        }
    }

    #[test]
    fn mismatched_alignment_falls_back() {
        let mut dst = Aligned([0; 256]);
        let src = pattern(64);
        unsafe { copy_to_mapped(dst.0.as_mut_ptr().add(3), &src) };
        assert_eq!(&dst.0[3..67], src.as_slice());
    }
}
