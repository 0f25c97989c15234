//! H.264 Annex-B inspection.
//!
//! Just enough bitstream parsing to validate a reassembled access unit and
//! classify it: split on start codes, read each NAL header, and flag
//! keyframes. No slice decoding happens here.

use bytes::Bytes;

/// NAL unit types (low 5 bits of the NAL header).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NalUnitType {
    /// Non-IDR slice (P or B frame)
    SliceNonIdr,
    /// IDR slice (keyframe)
    SliceIdr,
    /// Supplemental enhancement information
    Sei,
    /// Sequence parameter set
    Sps,
    /// Picture parameter set
    Pps,
    /// Access unit delimiter
    Aud,
    Other(u8),
}

impl From<u8> for NalUnitType {
    fn from(header: u8) -> Self {
        match header & 0x1F {
            1 => NalUnitType::SliceNonIdr,
            5 => NalUnitType::SliceIdr,
            6 => NalUnitType::Sei,
            7 => NalUnitType::Sps,
            8 => NalUnitType::Pps,
            9 => NalUnitType::Aud,
            n => NalUnitType::Other(n),
        }
    }
}

impl NalUnitType {
    pub fn is_keyframe(&self) -> bool {
        matches!(self, NalUnitType::SliceIdr)
    }

    pub fn is_parameter_set(&self) -> bool {
        matches!(self, NalUnitType::Sps | NalUnitType::Pps)
    }
}

/// One NAL unit, start code stripped, header byte included.
#[derive(Debug, Clone)]
pub struct NalUnit {
    pub nal_type: NalUnitType,
    pub data: Bytes,
}

/// Length of the Annex-B start code at the front of `data`: 3, 4, or 0.
pub fn start_code_len(data: &[u8]) -> usize {
    if data.starts_with(&[0, 0, 0, 1]) {
        4
    } else if data.starts_with(&[0, 0, 1]) {
        3
    } else {
        0
    }
}

/// Whether `data` begins with an Annex-B start code.
pub fn starts_with_start_code(data: &[u8]) -> bool {
    start_code_len(data) > 0
}

/// Split a complete access unit into its NAL units.
///
/// Returns an empty list if the unit does not begin with a start code.
pub fn split_nal_units(unit: &Bytes) -> Vec<NalUnit> {
    let first = start_code_len(unit);
    if first == 0 {
        return Vec::new();
    }

    let mut units = Vec::new();
    let mut start = first;
    let mut i = first;
    while i + 2 < unit.len() {
        if unit[i] == 0 && unit[i + 1] == 0 && unit[i + 2] == 1 {
            // A four-byte start code leaves one zero on the previous unit.
            let end = if i > start && unit[i - 1] == 0 { i - 1 } else { i };
            push_nal(&mut units, unit.slice(start..end));
            i += 3;
            start = i;
        } else {
            i += 1;
        }
    }
    push_nal(&mut units, unit.slice(start..));
    units
}

fn push_nal(units: &mut Vec<NalUnit>, data: Bytes) {
    if let Some(&header) = data.first() {
        units.push(NalUnit {
            nal_type: NalUnitType::from(header),
            data,
        });
    }
}

/// Whether the access unit carries an IDR slice.
pub fn is_keyframe(units: &[NalUnit]) -> bool {
    units.iter().any(|u| u.nal_type.is_keyframe())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_codes() {
        assert_eq!(start_code_len(&[0, 0, 0, 1, 0x67]), 4);
        assert_eq!(start_code_len(&[0, 0, 1, 0x41]), 3);
        assert_eq!(start_code_len(&[0x41, 0, 0, 1]), 0);
        assert!(!starts_with_start_code(&[0, 0]));
    }

    #[test]
    fn split_sps_pps_idr() {
        let unit = Bytes::from_static(&[
            0, 0, 0, 1, 0x67, 0x42, 0x00, // SPS
            0, 0, 0, 1, 0x68, 0xCE, // PPS
            0, 0, 1, 0x65, 0x88, 0x84, // IDR
        ]);
        let nals = split_nal_units(&unit);
        let types: Vec<_> = nals.iter().map(|n| n.nal_type).collect();
        assert_eq!(
            types,
            vec![NalUnitType::Sps, NalUnitType::Pps, NalUnitType::SliceIdr]
        );
        assert_eq!(&nals[0].data[..], &[0x67, 0x42, 0x00]);
        assert!(is_keyframe(&nals));
        assert!(nals[0].nal_type.is_parameter_set());
    }

    #[test]
    fn split_p_slice() {
        let unit = Bytes::from_static(&[0, 0, 0, 1, 0x41, 0x9A, 0x02]);
        let nals = split_nal_units(&unit);
        assert_eq!(nals.len(), 1);
        assert_eq!(nals[0].nal_type, NalUnitType::SliceNonIdr);
        assert!(!is_keyframe(&nals));
    }

    #[test]
    fn split_without_start_code_is_empty() {
        let unit = Bytes::from_static(&[0x41, 0x9A, 0x02]);
        assert!(split_nal_units(&unit).is_empty());
    }
}
