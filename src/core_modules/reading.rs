// THEORY:
// A soroban column holds one decimal digit: one heaven bead worth five and four
// earth beads worth one each. The engine never decides which beads are pushed
// to the beam; an external classifier does that from a normalized column image.
// This module owns the two ends of that exchange:
//
// 1.  `prepare_column` turns a sliced column into the classifier's input: a
//     64x128 grayscale image resized bilinearly.
// 2.  `combine_columns` turns per-column digits, read left to right, into one
//     number. The reading is only as confident as its weakest column.

use image::imageops::{self, FilterType};
use image::{GrayImage, RgbaImage};
use serde::{Deserialize, Serialize};

pub const COLUMN_INPUT_WIDTH: u32 = 64;
pub const COLUMN_INPUT_HEIGHT: u32 = 128;

/// Bead positions of one column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Beads {
    /// 0 or 1.
    pub heaven: u8,
    /// 0 to 4.
    pub earth: u8,
}

impl Beads {
    pub fn from_digit(digit: u8) -> Option<Self> {
        (digit <= 9).then(|| Self {
            heaven: digit / 5,
            earth: digit % 5,
        })
    }

    pub fn to_digit(self) -> Option<u8> {
        (self.heaven <= 1 && self.earth <= 4).then(|| self.heaven * 5 + self.earth)
    }
}

/// The classifier's answer for one column.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ColumnDigit {
    pub digit: u8,
    pub confidence: f64,
}

impl ColumnDigit {
    pub fn from_beads(beads: Beads, confidence: f64) -> Option<Self> {
        beads.to_digit().map(|digit| Self { digit, confidence })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnReading {
    pub value: u64,
    /// Minimum confidence over all columns.
    pub confidence: f64,
    pub digits: Vec<u8>,
}

/// Digits read left to right. `None` for no columns, a digit above 9, or a
/// value that does not fit in `u64`.
pub fn combine_columns(columns: &[ColumnDigit]) -> Option<ColumnReading> {
    if columns.is_empty() {
        return None;
    }
    let mut value = 0u64;
    let mut confidence = f64::INFINITY;
    for column in columns {
        if column.digit > 9 {
            return None;
        }
        value = value.checked_mul(10)?.checked_add(column.digit as u64)?;
        confidence = confidence.min(column.confidence);
    }
    Some(ColumnReading {
        value,
        confidence,
        digits: columns.iter().map(|c| c.digit).collect(),
    })
}

/// External digit classifier. Gets one prepared column at a time.
pub trait ColumnClassifier: Send {
    fn classify(&mut self, column: &GrayImage) -> Option<ColumnDigit>;
}

pub fn prepare_column(column: &RgbaImage) -> GrayImage {
    let gray = imageops::grayscale(column);
    imageops::resize(&gray, COLUMN_INPUT_WIDTH, COLUMN_INPUT_HEIGHT, FilterType::Triangle)
}

/// Prepares and classifies every column. Any column the classifier cannot
/// read voids the whole reading.
pub fn read_columns(classifier: &mut dyn ColumnClassifier, columns: &[RgbaImage]) -> Option<ColumnReading> {
    let digits = columns
        .iter()
        .map(|column| {
            if column.width() == 0 || column.height() == 0 {
                return None;
            }
            classifier.classify(&prepare_column(column))
        })
        .collect::<Option<Vec<_>>>()?;
    combine_columns(&digits)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    fn digit(digit: u8, confidence: f64) -> ColumnDigit {
        ColumnDigit { digit, confidence }
    }

    /// Reads the column's brightness as a digit.
    struct Brightness;

    impl ColumnClassifier for Brightness {
        fn classify(&mut self, column: &GrayImage) -> Option<ColumnDigit> {
            let level = column.get_pixel(32, 64).0[0];
            (level < 250).then(|| digit(level / 25, 0.9))
        }
    }

    #[test]
    fn bead_conversions() {
        assert_eq!(Beads::from_digit(7), Some(Beads { heaven: 1, earth: 2 }));
        assert_eq!(Beads::from_digit(4), Some(Beads { heaven: 0, earth: 4 }));
        assert_eq!(Beads::from_digit(10), None);
        assert_eq!(Beads { heaven: 1, earth: 4 }.to_digit(), Some(9));
        assert_eq!(Beads { heaven: 2, earth: 0 }.to_digit(), None);
        for d in 0..=9 {
            assert_eq!(Beads::from_digit(d).and_then(Beads::to_digit), Some(d));
        }
    }

    #[test]
    fn columns_read_left_to_right() {
        let reading = combine_columns(&[digit(0, 0.9), digit(4, 0.7), digit(2, 0.95)]).unwrap();
        assert_eq!(reading.value, 42);
        assert_eq!(reading.confidence, 0.7);
        assert_eq!(reading.digits, vec![0, 4, 2]);
    }

    #[test]
    fn rejects_empty_and_invalid() {
        assert_eq!(combine_columns(&[]), None);
        assert_eq!(combine_columns(&[digit(3, 0.9), digit(12, 0.9)]), None);
        assert_eq!(combine_columns(&vec![digit(9, 1.0); 21]), None);
    }

    #[test]
    fn prepared_column_has_classifier_shape() {
        let column = RgbaImage::from_pixel(37, 211, Rgba([200, 100, 50, 255]));
        let prepared = prepare_column(&column);
        assert_eq!(prepared.dimensions(), (COLUMN_INPUT_WIDTH, COLUMN_INPUT_HEIGHT));
    }

    #[test]
    fn one_unreadable_column_voids_reading() {
        let dark = RgbaImage::from_pixel(20, 40, Rgba([75, 75, 75, 255]));
        let blank = RgbaImage::from_pixel(20, 40, Rgba([255, 255, 255, 255]));
        let reading = read_columns(&mut Brightness, &[dark.clone(), dark.clone()]).unwrap();
        assert_eq!(reading.value, 33);
        assert_eq!(read_columns(&mut Brightness, &[dark.clone(), blank]), None);
        assert_eq!(read_columns(&mut Brightness, &[dark, RgbaImage::new(0, 40)]), None);
    }
}
