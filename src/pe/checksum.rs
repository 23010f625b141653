//! Image checksum.

/// Computes the `CheckSum` of a complete image.
///
/// The image is summed as little-endian 16-bit words with end-around carry, skipping the four
/// bytes of the checksum field at `checksum_offset`. A trailing odd byte counts as a word of
/// its own. The folded 16-bit sum is added to the file length.
#[must_use]
pub fn compute_checksum(image: &[u8], checksum_offset: usize) -> u32 {
    let file_size = image.len();
    let checksum_end = checksum_offset.saturating_add(4);

    let mut checksum: u64 = 0;
    let mut offset = 0;
    while offset < file_size {
        if offset >= checksum_offset && offset < checksum_end {
            offset += 2;
            continue;
        }

        let word = if offset + 1 < file_size {
            u64::from(u16::from_le_bytes([image[offset], image[offset + 1]]))
        } else {
            u64::from(image[offset])
        };

        checksum += word;
        if checksum > 0xFFFF {
            checksum = (checksum & 0xFFFF) + (checksum >> 16);
        }

        offset += 2;
    }

    checksum = (checksum & 0xFFFF) + (checksum >> 16);

    #[allow(clippy::cast_possible_truncation)]
    let folded = checksum as u32;
    folded.wrapping_add(u32::try_from(file_size).unwrap_or(u32::MAX))
}
