use std::fmt::{self, Display};

const RAMP: &[u8] = b" .:-=+*#%@";

/// A grayscale image drawn with one character per pixel, darkest to brightest.
pub struct Plot<'a> {
    pixels: &'a [f32],
    width: usize,
}

impl<'a> Plot<'a> {
    pub fn new(pixels: &'a [f32], width: usize) -> Self {
        Self { pixels, width }
    }
}

fn shade(intensity: f32) -> char {
    let last = RAMP.len() - 1;
    let index = (intensity.clamp(0.0, 1.0) * last as f32).round() as usize;

    char::from(RAMP[index.min(last)])
}

impl Display for Plot<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for row in self.pixels.chunks(self.width.max(1)) {
            // Doubled horizontally so the digit keeps its aspect ratio in a terminal.
            for &pixel in row {
                let shade = shade(pixel);
                write!(f, "{shade}{shade}")?;
            }

            writeln!(f)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test_case(0.0, ' '; "black")]
    #[test_case(1.0, '@'; "white")]
    #[test_case(0.5, '+'; "middle")]
    #[test_case(-3.0, ' '; "clamped below")]
    #[test_case(7.0, '@'; "clamped above")]
    fn intensity_to_shade(intensity: f32, expected: char) {
        assert_eq!(shade(intensity), expected);
    }

    #[test]
    fn draws_one_line_per_row() {
        let pixels = [0.0, 1.0, 1.0, 0.0];

        assert_eq!(Plot::new(&pixels, 2).to_string(), "  @@\n@@  \n");
    }
}
