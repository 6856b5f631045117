use std::fmt::{Display, Formatter};

use crate::protocol::Response;

const BYTES_PER_ROW: usize = 32;

// (rows, columns) of the sensor images the console knows how to lay out.
const MATRIX_SHAPES: [(usize, usize); 3] = [(36, 16), (36, 18), (34, 15)];

/// Console rendering of a reply packet.
pub struct PacketView<'a>(pub &'a Response);

impl PacketView<'_> {
    fn matrix_shape(&self) -> Option<(usize, usize)> {
        let len = self.0.payload.len();
        MATRIX_SHAPES
            .into_iter()
            .find(|(rows, cols)| rows * cols * 2 == len)
    }
}

impl Display for PacketView<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let response = self.0;
        if response.is_idle() {
            return Ok(());
        }
        let header = hex::encode_upper(response.header());
        if response.payload.is_empty() {
            return writeln!(f, "{header}");
        }
        writeln!(f, "Header={header}, Length={}", response.payload.len())?;

        if let Some((rows, cols)) = self.matrix_shape() {
            write!(f, "r\\c:")?;
            for col in 0..cols {
                write!(f, "{col:4} ")?;
            }
            writeln!(f, "\n")?;
            let mut values = response
                .payload
                .chunks_exact(2)
                .map(|w| i16::from_le_bytes([w[0], w[1]]));
            for row in 0..rows {
                write!(f, "{row:2}: ")?;
                for value in values.by_ref().take(cols) {
                    write!(f, "{value:4} ")?;
                }
                writeln!(f)?;
            }
            return Ok(());
        }

        write!(f, "     ")?;
        for i in 0..BYTES_PER_ROW {
            write!(f, "{i:02} ")?;
        }
        for (row, bytes) in response.payload.chunks(BYTES_PER_ROW).enumerate() {
            write!(f, "\n{:04}:", row * BYTES_PER_ROW)?;
            for b in bytes {
                write!(f, "{b:02X} ")?;
            }
        }
        writeln!(f)
    }
}
