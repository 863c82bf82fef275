//! Embedded geotag extraction.
//!
//! The EXIF payload is a little TIFF file: a byte-order mark, an offset to
//! IFD0, and a chain of 12-byte directory entries. IFD0 carries a pointer
//! (tag 0x8825) to the GPS directory, where latitude/longitude are stored as
//! three rationals (degrees, minutes, seconds) plus a one-letter hemisphere
//! reference.

use std::io::Cursor;

use image::{ImageDecoder, ImageReader};
use roadwatch_common::position::Position;

use crate::error::PipelineError;

const TAG_GPS_IFD: u16 = 0x8825;
const TAG_LAT_REF: u16 = 0x0001;
const TAG_LAT: u16 = 0x0002;
const TAG_LON_REF: u16 = 0x0003;
const TAG_LON: u16 = 0x0004;

const TYPE_ASCII: u16 = 2;
const TYPE_LONG: u16 = 4;
const TYPE_RATIONAL: u16 = 5;
const TYPE_SRATIONAL: u16 = 10;

const EXIF_HEADER: &[u8] = b"Exif\0\0";
const MAX_IFD_ENTRIES: usize = 512;

/// Convert a degrees/minutes/seconds triple to signed decimal degrees.
/// South and West references yield negative values.
pub fn dms_to_decimal(degrees: f64, minutes: f64, seconds: f64, reference: char) -> f64 {
    let decimal = degrees + minutes / 60.0 + seconds / 3600.0;
    match reference.to_ascii_uppercase() {
        'S' | 'W' => -decimal,
        _ => decimal,
    }
}

/// Read the geotag embedded in an encoded image.
///
/// `Ok(None)` means the image simply has no EXIF/GPS block; an error means
/// one was present but could not be interpreted.
pub fn read_geotag(image_bytes: &[u8]) -> Result<Option<Position>, PipelineError> {
    let reader = ImageReader::new(Cursor::new(image_bytes))
        .with_guessed_format()
        .map_err(|e| PipelineError::GeotagUnparseable(e.to_string()))?;
    let mut decoder = reader
        .into_decoder()
        .map_err(|e| PipelineError::GeotagUnparseable(e.to_string()))?;
    let exif = decoder
        .exif_metadata()
        .map_err(|e| PipelineError::GeotagUnparseable(e.to_string()))?;

    match exif {
        Some(raw) => parse_exif_gps(&raw),
        None => Ok(None),
    }
}

/// Parse the GPS position out of a raw EXIF (TIFF) block.
pub fn parse_exif_gps(raw: &[u8]) -> Result<Option<Position>, PipelineError> {
    let data = raw.strip_prefix(EXIF_HEADER).unwrap_or(raw);
    let tiff = Tiff::new(data).ok_or_else(|| unparseable("bad TIFF header"))?;

    let ifd0 = tiff
        .u32_at(4)
        .ok_or_else(|| unparseable("missing IFD0 offset"))?;
    let entries = tiff
        .entries(ifd0 as usize)
        .ok_or_else(|| unparseable("truncated IFD0"))?;

    let Some(gps_pointer) = entries.iter().find(|e| e.tag == TAG_GPS_IFD) else {
        return Ok(None);
    };
    if gps_pointer.kind != TYPE_LONG {
        return Err(unparseable("GPS IFD pointer has unexpected type"));
    }
    let gps_entries = tiff
        .entries(gps_pointer.value as usize)
        .ok_or_else(|| unparseable("truncated GPS IFD"))?;

    let find = |tag: u16| gps_entries.iter().find(|e| e.tag == tag);
    let (lat, lat_ref, lon, lon_ref) = match (
        find(TAG_LAT),
        find(TAG_LAT_REF),
        find(TAG_LON),
        find(TAG_LON_REF),
    ) {
        (None, None, None, None) => return Ok(None),
        (Some(lat), Some(lat_ref), Some(lon), Some(lon_ref)) => (lat, lat_ref, lon, lon_ref),
        _ => return Err(unparseable("partial GPS block")),
    };

    let lat = tiff.coordinate(lat, lat_ref)?;
    let lon = tiff.coordinate(lon, lon_ref)?;
    if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
        return Err(unparseable("coordinate out of range"));
    }
    Ok(Some(Position::new(lat, lon)))
}

fn unparseable(reason: &str) -> PipelineError {
    PipelineError::GeotagUnparseable(reason.to_string())
}

// ---------------------------------------------------------------------------
// Minimal TIFF reader
// ---------------------------------------------------------------------------

struct IfdEntry {
    tag: u16,
    kind: u16,
    count: u32,
    /// Inline value or offset to it, depending on size.
    value: u32,
    /// Position of the 4-byte value field inside the TIFF block.
    value_pos: usize,
}

struct Tiff<'a> {
    data: &'a [u8],
    big_endian: bool,
}

impl<'a> Tiff<'a> {
    fn new(data: &'a [u8]) -> Option<Self> {
        let big_endian = match data.get(0..2)? {
            b"II" => false,
            b"MM" => true,
            _ => return None,
        };
        let tiff = Self { data, big_endian };
        (tiff.u16_at(2)? == 42).then_some(tiff)
    }

    fn u16_at(&self, pos: usize) -> Option<u16> {
        let bytes: [u8; 2] = self.data.get(pos..pos + 2)?.try_into().ok()?;
        Some(if self.big_endian {
            u16::from_be_bytes(bytes)
        } else {
            u16::from_le_bytes(bytes)
        })
    }

    fn u32_at(&self, pos: usize) -> Option<u32> {
        let bytes: [u8; 4] = self.data.get(pos..pos + 4)?.try_into().ok()?;
        Some(if self.big_endian {
            u32::from_be_bytes(bytes)
        } else {
            u32::from_le_bytes(bytes)
        })
    }

    fn entries(&self, offset: usize) -> Option<Vec<IfdEntry>> {
        let count = self.u16_at(offset)? as usize;
        if count > MAX_IFD_ENTRIES {
            return None;
        }
        (0..count)
            .map(|i| {
                let pos = offset + 2 + i * 12;
                Some(IfdEntry {
                    tag: self.u16_at(pos)?,
                    kind: self.u16_at(pos + 2)?,
                    count: self.u32_at(pos + 4)?,
                    value: self.u32_at(pos + 8)?,
                    value_pos: pos + 8,
                })
            })
            .collect()
    }

    fn reference(&self, entry: &IfdEntry) -> Result<char, PipelineError> {
        if entry.kind != TYPE_ASCII || entry.count == 0 {
            return Err(unparseable("hemisphere reference is not ASCII"));
        }
        let pos = if entry.count <= 4 {
            entry.value_pos
        } else {
            entry.value as usize
        };
        let byte = *self
            .data
            .get(pos)
            .ok_or_else(|| unparseable("hemisphere reference out of bounds"))?;
        match byte.to_ascii_uppercase() {
            c @ (b'N' | b'S' | b'E' | b'W') => Ok(c as char),
            _ => Err(unparseable("unknown hemisphere reference")),
        }
    }

    fn rationals(&self, entry: &IfdEntry) -> Result<[f64; 3], PipelineError> {
        if !matches!(entry.kind, TYPE_RATIONAL | TYPE_SRATIONAL) || entry.count < 3 {
            return Err(unparseable("coordinate is not a rational triple"));
        }
        let base = entry.value as usize;
        let mut out = [0.0; 3];
        for (i, slot) in out.iter_mut().enumerate() {
            let pos = base + i * 8;
            let (num, den) = match (self.u32_at(pos), self.u32_at(pos + 4)) {
                (Some(n), Some(d)) => (n, d),
                _ => return Err(unparseable("coordinate out of bounds")),
            };
            if den == 0 {
                return Err(unparseable("zero denominator"));
            }
            *slot = if entry.kind == TYPE_SRATIONAL {
                num as i32 as f64 / den as i32 as f64
            } else {
                num as f64 / den as f64
            };
        }
        Ok(out)
    }

    fn coordinate(&self, value: &IfdEntry, reference: &IfdEntry) -> Result<f64, PipelineError> {
        let [d, m, s] = self.rationals(value)?;
        let r = self.reference(reference)?;
        Ok(dms_to_decimal(d, m, s, r))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Build a little-endian TIFF block with a GPS IFD.
    pub(crate) fn gps_exif(lat: [(u32, u32); 3], lat_ref: u8, lon: [(u32, u32); 3], lon_ref: u8) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(b"II");
        buf.extend_from_slice(&42u16.to_le_bytes());
        buf.extend_from_slice(&8u32.to_le_bytes());

        // IFD0 at 8: one entry pointing at the GPS IFD (at 26).
        buf.extend_from_slice(&1u16.to_le_bytes());
        push_entry(&mut buf, TAG_GPS_IFD, TYPE_LONG, 1, 26u32.to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes());
        assert_eq!(buf.len(), 26);

        // GPS IFD at 26: four entries, data area starts at 80.
        buf.extend_from_slice(&4u16.to_le_bytes());
        push_entry(&mut buf, TAG_LAT_REF, TYPE_ASCII, 2, [lat_ref, 0, 0, 0]);
        push_entry(&mut buf, TAG_LAT, TYPE_RATIONAL, 3, 80u32.to_le_bytes());
        push_entry(&mut buf, TAG_LON_REF, TYPE_ASCII, 2, [lon_ref, 0, 0, 0]);
        push_entry(&mut buf, TAG_LON, TYPE_RATIONAL, 3, 104u32.to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes());
        assert_eq!(buf.len(), 80);

        for (n, d) in lat.iter().chain(lon.iter()) {
            buf.extend_from_slice(&n.to_le_bytes());
            buf.extend_from_slice(&d.to_le_bytes());
        }
        buf
    }

    fn push_entry(buf: &mut Vec<u8>, tag: u16, kind: u16, count: u32, value: [u8; 4]) {
        buf.extend_from_slice(&tag.to_le_bytes());
        buf.extend_from_slice(&kind.to_le_bytes());
        buf.extend_from_slice(&count.to_le_bytes());
        buf.extend_from_slice(&value);
    }

    #[test]
    fn dms_north_and_south() {
        let north = dms_to_decimal(40.0, 26.0, 46.0, 'N');
        let south = dms_to_decimal(40.0, 26.0, 46.0, 'S');
        assert!((north - 40.4461).abs() < 1e-4);
        assert!((south + 40.4461).abs() < 1e-4);
    }

    #[test]
    fn dms_west_is_negative() {
        assert!(dms_to_decimal(74.0, 0.0, 21.6, 'W') < 0.0);
        assert!(dms_to_decimal(74.0, 0.0, 21.6, 'E') > 0.0);
    }

    #[test]
    fn parses_gps_block() {
        let exif = gps_exif(
            [(40, 1), (26, 1), (46, 1)],
            b'N',
            [(79, 1), (58, 1), (5616, 100)],
            b'W',
        );
        let pos = parse_exif_gps(&exif).unwrap().unwrap();
        assert!((pos.lat - 40.4461).abs() < 1e-4);
        assert!((pos.lon + 79.9823).abs() < 1e-3);
    }

    #[test]
    fn tolerates_exif_header_prefix() {
        let mut exif = b"Exif\0\0".to_vec();
        exif.extend(gps_exif([(1, 1), (0, 1), (0, 1)], b'S', [(2, 1), (0, 1), (0, 1)], b'E'));
        let pos = parse_exif_gps(&exif).unwrap().unwrap();
        assert_eq!(pos.lat, -1.0);
        assert_eq!(pos.lon, 2.0);
    }

    #[test]
    fn zero_denominator_is_unparseable() {
        let exif = gps_exif([(40, 0), (26, 1), (46, 1)], b'N', [(1, 1), (0, 1), (0, 1)], b'E');
        let err = parse_exif_gps(&exif).unwrap_err();
        assert!(matches!(err, PipelineError::GeotagUnparseable(_)));
    }

    #[test]
    fn bad_reference_is_unparseable() {
        let exif = gps_exif([(40, 1), (26, 1), (46, 1)], b'X', [(1, 1), (0, 1), (0, 1)], b'E');
        assert!(parse_exif_gps(&exif).is_err());
    }

    #[test]
    fn truncated_block_is_unparseable() {
        let exif = gps_exif([(40, 1), (26, 1), (46, 1)], b'N', [(1, 1), (0, 1), (0, 1)], b'E');
        assert!(parse_exif_gps(&exif[..60]).is_err());
        assert!(parse_exif_gps(b"garbage").is_err());
    }

    #[test]
    fn no_gps_pointer_is_none() {
        let mut buf = Vec::new();
        buf.extend_from_slice(b"MM");
        buf.extend_from_slice(&42u16.to_be_bytes());
        buf.extend_from_slice(&8u32.to_be_bytes());
        buf.extend_from_slice(&0u16.to_be_bytes());
        buf.extend_from_slice(&0u32.to_be_bytes());
        assert_eq!(parse_exif_gps(&buf).unwrap(), None);
    }

    #[test]
    fn plain_jpeg_has_no_geotag() {
        let img = image::RgbImage::from_pixel(8, 8, image::Rgb([120, 120, 120]));
        let mut jpeg = Vec::new();
        image::codecs::jpeg::JpegEncoder::new_with_quality(&mut jpeg, 80)
            .encode_image(&img)
            .unwrap();
        assert_eq!(read_geotag(&jpeg).unwrap(), None);
    }
}
