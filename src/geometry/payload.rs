//! Polygon payload stored in `surface_geometry.geometry`.
//!
//! One outer ring followed by zero or more inner rings, each a flat ordinate
//! array of `dimension`-sized points. Archived with rkyv and validated on read.

use rkyv::{Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Failed to encode polygon payload: {0}")]
    Encode(String),
    #[error("Invalid polygon payload: {0}")]
    Decode(String),
    #[error("Unsupported coordinate dimension {0}")]
    Dimension(u8),
    #[error("Ring {ring} has {len} ordinates, not a multiple of dimension {dimension}")]
    RingLength {
        ring: usize,
        len: usize,
        dimension: u8,
    },
    #[error("Ring offsets {0:?} do not partition the ordinate array")]
    Offsets(Vec<usize>),
}

pub type Result<T> = std::result::Result<T, CodecError>;

#[derive(Debug, Clone, PartialEq, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub struct PolygonPayload {
    pub srid: i32,
    pub dimension: u8,
    pub rings: Vec<Vec<f64>>,
}

impl PolygonPayload {
    pub fn new(srid: i32, dimension: u8, rings: Vec<Vec<f64>>) -> Result<Self> {
        let payload = Self {
            srid,
            dimension,
            rings,
        };
        payload.validate()?;
        Ok(payload)
    }

    /// Build from a flat ordinate array and the start offset of every ring.
    pub fn from_ordinates(
        srid: i32,
        dimension: u8,
        ordinates: &[f64],
        ring_offsets: &[usize],
    ) -> Result<Self> {
        let valid_offsets = ring_offsets.first() == Some(&0)
            && ring_offsets.windows(2).all(|w| w[0] < w[1])
            && ring_offsets.last().is_some_and(|last| *last < ordinates.len());
        if !valid_offsets {
            return Err(CodecError::Offsets(ring_offsets.to_vec()));
        }

        let rings = ring_offsets
            .iter()
            .enumerate()
            .map(|(i, start)| {
                let end = ring_offsets.get(i + 1).copied().unwrap_or(ordinates.len());
                ordinates[*start..end].to_vec()
            })
            .collect();

        Self::new(srid, dimension, rings)
    }

    fn validate(&self) -> Result<()> {
        if !(2..=4).contains(&self.dimension) {
            return Err(CodecError::Dimension(self.dimension));
        }
        let dim = self.dimension as usize;
        for (ring, ordinates) in self.rings.iter().enumerate() {
            if ordinates.len() % dim != 0 {
                return Err(CodecError::RingLength {
                    ring,
                    len: ordinates.len(),
                    dimension: self.dimension,
                });
            }
        }
        Ok(())
    }

    pub fn ordinates(&self) -> Vec<f64> {
        self.rings.iter().flatten().copied().collect()
    }

    pub fn ring_offsets(&self) -> Vec<usize> {
        let mut offsets = Vec::with_capacity(self.rings.len());
        let mut start = 0;
        for ring in &self.rings {
            offsets.push(start);
            start += ring.len();
        }
        offsets
    }

    /// Flip the point order inside every ring. Ring order is unchanged.
    pub fn reverse_rings(&mut self) {
        let dim = self.dimension as usize;
        for ring in &mut self.rings {
            let reversed: Vec<f64> = ring.chunks(dim).rev().flatten().copied().collect();
            *ring = reversed;
        }
    }

    pub fn reversed(mut self) -> Self {
        self.reverse_rings();
        self
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let bytes =
            rkyv::to_bytes::<_, 256>(self).map_err(|e| CodecError::Encode(e.to_string()))?;
        Ok(bytes.into_vec())
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        // Blobs read from the store carry no alignment guarantee
        let mut aligned = rkyv::AlignedVec::with_capacity(bytes.len());
        aligned.extend_from_slice(bytes);

        let archived = rkyv::check_archived_root::<PolygonPayload>(&aligned)
            .map_err(|e| CodecError::Decode(e.to_string()))?;

        let payload = PolygonPayload {
            srid: archived.srid,
            dimension: archived.dimension,
            rings: archived.rings.iter().map(|ring| ring.to_vec()).collect(),
        };
        payload.validate()?;
        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square_with_hole() -> PolygonPayload {
        #[rustfmt::skip]
        let ordinates = vec![
            // outer: 4 points
            0.0, 0.0, 0.0,
            10.0, 0.0, 0.0,
            10.0, 10.0, 0.0,
            0.0, 0.0, 0.0,
            // inner: 3 points
            2.0, 2.0, 0.0,
            3.0, 2.0, 0.0,
            2.0, 2.0, 0.0,
        ];
        PolygonPayload::from_ordinates(25832, 3, &ordinates, &[0, 12]).unwrap()
    }

    #[test]
    fn test_reverse_round_trip() {
        let original = square_with_hole();
        let twice = original.clone().reversed().reversed();
        assert_eq!(twice.ordinates(), original.ordinates());
        assert_eq!(twice.ring_offsets(), vec![0, 12]);
    }

    #[test]
    fn test_reverse_flips_each_ring_independently() {
        let reversed = square_with_hole().reversed();
        assert_eq!(reversed.rings.len(), 2);
        assert_eq!(reversed.ring_offsets(), vec![0, 12]);

        #[rustfmt::skip]
        let expected_outer = vec![
            0.0, 0.0, 0.0,
            10.0, 10.0, 0.0,
            10.0, 0.0, 0.0,
            0.0, 0.0, 0.0,
        ];
        #[rustfmt::skip]
        let expected_inner = vec![
            2.0, 2.0, 0.0,
            3.0, 2.0, 0.0,
            2.0, 2.0, 0.0,
        ];
        assert_eq!(reversed.rings[0], expected_outer);
        assert_eq!(reversed.rings[1], expected_inner);
    }

    #[test]
    fn test_reverse_asymmetric_ring() {
        let mut payload =
            PolygonPayload::new(0, 2, vec![vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]]).unwrap();
        payload.reverse_rings();
        assert_eq!(payload.rings[0], vec![5.0, 6.0, 3.0, 4.0, 1.0, 2.0]);
    }

    #[test]
    fn test_encode_decode() {
        let payload = square_with_hole();
        let bytes = payload.encode().unwrap();
        assert_eq!(PolygonPayload::decode(&bytes).unwrap(), payload);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(PolygonPayload::decode(b"not a payload").is_err());
    }

    #[test]
    fn test_invalid_shapes() {
        assert!(matches!(
            PolygonPayload::new(0, 3, vec![vec![1.0, 2.0]]),
            Err(CodecError::RingLength { ring: 0, .. })
        ));
        assert!(matches!(
            PolygonPayload::new(0, 7, vec![]),
            Err(CodecError::Dimension(7))
        ));
        assert!(matches!(
            PolygonPayload::from_ordinates(0, 3, &[0.0; 6], &[3, 0]),
            Err(CodecError::Offsets(_))
        ));
    }
}
