/*!
bit packing for tokens that travel through a pointer-sized slot.

Each half of a `usize` carries one field, so a 64-bit target gets 32 bits of
index and generation while a 32-bit target gets 16 of each.
*/

pub const HALF_BITS: u32 = usize::BITS / 2;
pub const HALF_MASK: usize = (1 << HALF_BITS) - 1;

pub fn usize_to_halves(packed: usize) -> (usize, usize) {
    (packed >> HALF_BITS, packed & HALF_MASK)
}

pub fn halves_to_usize(high: usize, low: usize) -> usize {
    ((high & HALF_MASK) << HALF_BITS) | (low & HALF_MASK)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn halves_survive_packing() {
        let packed = halves_to_usize(7, 42);
        assert_eq!(usize_to_halves(packed), (7, 42));
    }

    #[test]
    fn oversized_halves_are_masked() {
        let packed = halves_to_usize(HALF_MASK + 2, 3);
        assert_eq!(usize_to_halves(packed), (1, 3));
    }
}
