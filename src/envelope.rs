use crate::crs::CrsTransform;
use crate::error::{Error, Result};

/// An axis-aligned envelope in (min-x, min-y, max-x, max-y) order, in
/// whatever CRS it was computed in.
pub type MinMaxEnvelope = (f64, f64, f64, f64);

/// A bounding box (w, s, e, n) in degrees longitude / latitude.
///
/// Always "wrapped": longitudes are in [-180, 180], s <= n, and w <= e unless
/// the envelope crosses the antimeridian, in which case e < w.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Envelope {
    pub w: f64,
    pub s: f64,
    pub e: f64,
    pub n: f64,
}

impl Envelope {
    pub fn new(w: f64, s: f64, e: f64, n: f64) -> Envelope {
        Envelope { w, s, e, n }
    }

    /// True if `other` lies entirely within this envelope, accounting for
    /// antimeridian wrapping on both sides.
    pub fn contains(&self, other: &Envelope) -> bool {
        if !(self.s <= other.s && other.n <= self.n) {
            return false;
        }
        let (w, e) = unwrap_lon_envelope(self.w, self.e);
        if e - w >= 360.0 {
            // Full-width: covers every longitude, however `other` is wrapped.
            return true;
        }
        let (ow, oe) = unwrap_lon_envelope(other.w, other.e);
        [-360.0, 0.0, 360.0]
            .iter()
            .any(|shift| w <= ow + shift && oe + shift <= e)
    }

    /// True if the two envelopes overlap, accounting for wrapping.
    pub fn intersects(&self, other: &Envelope) -> bool {
        if self.n < other.s || other.n < self.s {
            return false;
        }
        let (w, e) = unwrap_lon_envelope(self.w, self.e);
        let (ow, oe) = unwrap_lon_envelope(other.w, other.e);
        [-360.0, 0.0, 360.0]
            .iter()
            .any(|shift| w <= oe + shift && ow + shift <= e)
    }
}

/// GPKG headers store envelopes as (min-x, max-x, min-y, max-y); this
/// transposes to (min-x, min-y, max-x, max-y). Antimeridian handling happens
/// separately in [`transform_minmax_envelope`].
pub fn transpose_gpkg_envelope(envelope: (f64, f64, f64, f64)) -> MinMaxEnvelope {
    (envelope.0, envelope.2, envelope.1, envelope.3)
}

pub fn is_valid_envelope(env: &Envelope) -> bool {
    (-180.0..=180.0).contains(&env.w)
        && (-90.0..=90.0).contains(&env.s)
        && (-180.0..=180.0).contains(&env.e)
        && (-90.0 < env.n && env.n <= 90.0)
        && env.s <= env.n
}

// -------------------------------------------------------------------------------------------------
// EnvelopeEncoder
// -------------------------------------------------------------------------------------------------
/// Encodes and decodes envelopes into a fixed-width binary form.
///
/// Each of the four values is scaled to an unsigned integer of
/// `bits_per_value` bits, where 0 is the minimum (-180 or -90) and the top
/// value is the maximum (180 or 90). w and s round down, e and n round up, so
/// a decoded envelope always contains the one that was encoded - queries over
/// stored envelopes can produce false positives but never false negatives.
///
/// More bits mean more accuracy but more space per feature. The width is
/// chosen once per database; when extending an existing database the stored
/// width is reused.
pub struct EnvelopeEncoder {
    pub bits_per_value: u32,
}

impl EnvelopeEncoder {
    pub const DEFAULT_BITS_PER_VALUE: u32 = 20;

    pub fn new(bits_per_value: Option<u32>) -> Result<EnvelopeEncoder> {
        let bits_per_value = bits_per_value.unwrap_or(Self::DEFAULT_BITS_PER_VALUE);
        // Four values must pack into whole bytes, and into a u128.
        if bits_per_value % 2 != 0 || bits_per_value == 0 || bits_per_value > 30 {
            return Err(Error::InvalidOperation(format!(
                "invalid envelope bits-per-value: {bits_per_value}"
            )));
        }
        Ok(EnvelopeEncoder { bits_per_value })
    }

    pub fn bytes_per_envelope(&self) -> usize {
        (4 * self.bits_per_value as usize) / 8
    }

    fn value_max(&self) -> u128 {
        (1u128 << self.bits_per_value) - 1
    }

    fn encode_value(&self, value: f64, min_value: f64, max_value: f64, ceil: bool) -> u128 {
        let value = value.clamp(min_value, max_value);
        let normalised = (value - min_value) / (max_value - min_value);
        let scaled = normalised * self.value_max() as f64;
        let encoded = if ceil { scaled.ceil() } else { scaled.floor() } as u128;
        encoded.min(self.value_max())
    }

    fn decode_value(&self, encoded: u128, min_value: f64, max_value: f64) -> f64 {
        let normalised = encoded as f64 / self.value_max() as f64;
        normalised * (max_value - min_value) + min_value
    }

    pub fn encode(&self, envelope: &Envelope) -> Vec<u8> {
        let bits = self.bits_per_value;
        let mut packed = self.encode_value(envelope.w, -180.0, 180.0, false);
        packed = (packed << bits) | self.encode_value(envelope.s, -90.0, 90.0, false);
        packed = (packed << bits) | self.encode_value(envelope.e, -180.0, 180.0, true);
        packed = (packed << bits) | self.encode_value(envelope.n, -90.0, 90.0, true);

        let n_bytes = self.bytes_per_envelope();
        let bytes = packed.to_be_bytes();
        bytes[bytes.len() - n_bytes..].to_vec()
    }

    pub fn decode(&self, encoded: &[u8]) -> Result<Envelope> {
        if encoded.len() != self.bytes_per_envelope() {
            return Err(Error::InvalidFileFormat(format!(
                "encoded envelope should be {} bytes, got {}",
                self.bytes_per_envelope(),
                encoded.len()
            )));
        }
        let mut packed = 0u128;
        for byte in encoded {
            packed = (packed << 8) | *byte as u128;
        }
        let bits = self.bits_per_value;
        let n = self.decode_value(packed & self.value_max(), -90.0, 90.0);
        packed >>= bits;
        let e = self.decode_value(packed & self.value_max(), -180.0, 180.0);
        packed >>= bits;
        let s = self.decode_value(packed & self.value_max(), -90.0, 90.0);
        packed >>= bits;
        let w = self.decode_value(packed & self.value_max(), -180.0, 180.0);
        Ok(Envelope { w, s, e, n })
    }
}

// -------------------------------------------------------------------------------------------------
// longitude helpers
// -------------------------------------------------------------------------------------------------
/// Puts any longitude in the range [-180, 180) without moving its position on
/// earth.
pub fn wrap_lon(x: f64) -> f64 {
    (x + 180.0).rem_euclid(360.0) - 180.0
}

/// Clamps any latitude to [-90, 90]. Use with care - this can hide CRS
/// problems.
pub fn clamp_lat(y: f64) -> f64 {
    y.clamp(-90.0, 90.0)
}

/// Given a wrapped longitude range, returns an equivalent range where w stays
/// put and e exceeds w by the true width: 0 <= (e - w) <= 360.
fn unwrap_lon_envelope(w: f64, e: f64) -> (f64, f64) {
    if w <= e {
        (w, e)
    } else {
        (w, e + 360.0)
    }
}

/// Given an unwrapped longitude range (w <= e, possibly outside [-180, 180]),
/// wraps both ends back into [-180, 180] preserving which end is which.
fn wrap_lon_envelope(w: f64, e: f64) -> (f64, f64) {
    let wrapped_w = wrap_lon(w);
    let wrapped_e = wrap_lon(e);
    let min_x = wrapped_w.min(wrapped_e);
    let max_x = wrapped_w.max(wrapped_e);
    if ((max_x - min_x) - (e - w)).abs() <= 1e-3 {
        (min_x, max_x)
    } else {
        (max_x, min_x)
    }
}

// -------------------------------------------------------------------------------------------------
// ring geometry
// -------------------------------------------------------------------------------------------------
fn minmax_envelope_dimensions(envelope: MinMaxEnvelope) -> (f64, f64) {
    (envelope.2 - envelope.0, envelope.3 - envelope.1)
}

fn max_abs_y(envelope: MinMaxEnvelope) -> f64 {
    envelope.1.abs().max(envelope.3.abs())
}

/// Builds an anticlockwise closed ring around the envelope, starting at
/// (min-x, min-y). With `segments_per_side`, edges are subdivided so no
/// segment is longer than the chosen segment length - needed so that edge
/// curvature under a projection is sampled, not just the corners.
fn ring_from_minmax_envelope(
    envelope: MinMaxEnvelope,
    segments_per_side: Option<usize>,
) -> Vec<(f64, f64)> {
    let (minx, miny, maxx, maxy) = envelope;
    let corners = [
        (minx, miny),
        (maxx, miny),
        (maxx, maxy),
        (minx, maxy),
        (minx, miny),
    ];

    let segment_length = segments_per_side.map(|segments| {
        let (width, height) = minmax_envelope_dimensions(envelope);
        let larger = width.max(height);
        let smaller = width.min(height);
        if smaller < larger / 4.0 {
            larger / segments as f64
        } else {
            smaller / segments as f64
        }
    });

    match segment_length {
        None => corners.to_vec(),
        Some(segment_length) => {
            let mut ring = Vec::new();
            for pair in corners.windows(2) {
                let (x0, y0) = pair[0];
                let (x1, y1) = pair[1];
                let edge_length = ((x1 - x0).powi(2) + (y1 - y0).powi(2)).sqrt();
                let pieces = (edge_length / segment_length).ceil().max(1.0) as usize;
                for i in 0..pieces {
                    let t = i as f64 / pieces as f64;
                    ring.push((x0 + (x1 - x0) * t, y0 + (y1 - y0) * t));
                }
            }
            ring.push(corners[0]);
            ring
        }
    }
}

fn transform_ring(ring: &mut [(f64, f64)], transform: &dyn CrsTransform) -> Result<()> {
    for point in ring.iter_mut() {
        *point = transform.transform_xy(point.0, point.1)?;
    }
    Ok(())
}

fn ring_envelope(ring: &[(f64, f64)]) -> MinMaxEnvelope {
    let mut env = (f64::INFINITY, f64::INFINITY, f64::NEG_INFINITY, f64::NEG_INFINITY);
    for (x, y) in ring {
        env.0 = env.0.min(*x);
        env.1 = env.1.min(*y);
        env.2 = env.2.max(*x);
        env.3 = env.3.max(*y);
    }
    env
}

/// Shoelace-formula area test. The first and last point must be the same.
/// https://en.wikipedia.org/wiki/Shoelace_formula
fn is_clockwise(ring: &[(f64, f64)]) -> bool {
    let mut result = 0.0;
    for pair in ring.windows(2) {
        let (x0, y0) = pair[0];
        let (x1, y1) = pair[1];
        result += x0 * y1 - x1 * y0;
    }
    result < 0.0
}

/// Adds 360 degrees to all points west of `split_x`. The points stay in the
/// same place on earth, but the winding order of the ring - and which edges
/// appear to cross the antimeridian - can change.
fn reinterpret_to_be_east_of(split_x: f64, ring: &mut [(f64, f64)]) {
    for point in ring.iter_mut() {
        if point.0 < split_x {
            point.0 += 360.0;
        }
    }
}

/// Shifts points eastward by 360 degrees until the ring's winding order is
/// anticlockwise again. O(n^2), so best used on rectangles. Returns the x
/// value all points were shifted to be east of, or `None` if no shifting was
/// needed.
fn fix_ring_winding_order(ring: &mut [(f64, f64)]) -> Result<Option<f64>> {
    if !is_clockwise(ring) {
        return Ok(None);
    }
    let mut xs: Vec<f64> = ring.iter().map(|p| p.0).collect();
    xs.sort_by(f64::total_cmp);
    xs.dedup();
    for pair in xs.windows(2) {
        let split_x = (pair[0] + pair[1]) / 2.0;
        reinterpret_to_be_east_of(split_x, ring);
        if !is_clockwise(ring) {
            return Ok(Some(split_x));
        }
    }
    Err(Error::Geometry(
        "couldn't fix ring winding order by shifting around the antimeridian".into(),
    ))
}

// -------------------------------------------------------------------------------------------------
// envelope transformation
// -------------------------------------------------------------------------------------------------
/// Transforms an envelope in any CRS to an axis-aligned WGS 84 envelope that
/// bounds the original (possibly slightly larger - axis-aligned edges don't
/// line up with the original's).
///
/// A transformed envelope much larger than the planet, or far off it, means
/// the wrong CRS was used for this geometry: `CannotIndexDueToWrongCrs`. An
/// envelope at least a hemisphere wide cannot be interpreted unambiguously -
/// it may or may not cross the antimeridian - so it fails with `CannotIndex`.
///
/// With `buffer_for_curvature`, a buffer is added to all sides so that the
/// curved edges of the original envelope - not just its corners - are
/// contained in the result.
pub fn transform_minmax_envelope(
    envelope: MinMaxEnvelope,
    transform: &dyn CrsTransform,
    buffer_for_curvature: bool,
) -> Result<Envelope> {
    let (minx, miny, maxx, maxy) = envelope;

    // Points / envelopes with zero area:
    if minx == maxx && miny == maxy {
        let (x, y) = transform.transform_xy(minx, miny)?;
        let x = wrap_lon(x);
        let polarmost_y = y.abs();
        if polarmost_y > 1000.0 {
            return Err(Error::CannotIndexDueToWrongCrs(x, y, x, y));
        }
        if polarmost_y > 90.0 {
            return Err(Error::CannotIndex(x, y, x, y));
        }
        return Ok(Envelope::new(x, y, x, y));
    }

    let mut ring = ring_from_minmax_envelope(envelope, None);
    transform_ring(&mut ring, transform)?;

    // Depending on the transform, the ring may now be split in two by the
    // antimeridian (transforms almost always land longitudes in [-180, 180]).
    // Try to make it contiguous so its min-max envelope is meaningful.
    let mut transformed = ring_envelope(&ring);
    let (mut width, mut height) = minmax_envelope_dimensions(transformed);
    let mut split_x = None;
    if width >= 180.0 && is_clockwise(&ring) {
        // The ring was anticlockwise but became clockwise when projected into
        // [-180, 180]: it crosses the antimeridian. Reinterpret until
        // anticlockwise again, then min-x / max-x are a true w / e.
        split_x = fix_ring_winding_order(&mut ring)?;
        transformed = ring_envelope(&ring);
        (width, height) = minmax_envelope_dimensions(transformed);
    }

    let polarmost_y = max_abs_y(transformed);

    if width > 1000.0 || height > 1000.0 || polarmost_y > 1000.0 {
        // A lot larger than the planet, or a long way off it. The threshold
        // is 1000 rather than 180/90 since slightly-out-of-range data can't
        // be distinguished from a wrong CRS.
        return Err(Error::CannotIndexDueToWrongCrs(
            transformed.0, transformed.1, transformed.2, transformed.3,
        ));
    }
    if width >= 180.0 {
        // Likely a geometry that crosses the antimeridian stored in two
        // halves, one near -180 and one near 180 - min-x/max-x are then just
        // roughly -180 and 180, not the true extremes. (Or it genuinely is
        // wider than a hemisphere; there's no way to tell the difference.)
        return Err(Error::CannotIndex(
            transformed.0, transformed.1, transformed.2, transformed.3,
        ));
    }
    if polarmost_y > 90.0 {
        return Err(Error::CannotIndex(
            transformed.0, transformed.1, transformed.2, transformed.3,
        ));
    }

    if buffer_for_curvature {
        let biggest_dimension = width.max(height);
        if biggest_dimension < 1.0 {
            // Less than a degree on a side - line curvature is minimal. An
            // extra 1/10th of the envelope size on all edges covers it.
            transformed = buffer_minmax_envelope(transformed, 0.1 * biggest_dimension);
        } else {
            // Redo the calculation with a segmented ring so segments span no
            // more than about a degree, then pad by a further 1/10th degree.
            let segments_per_side = (biggest_dimension.ceil() as usize).max(10);
            let mut ring = ring_from_minmax_envelope(envelope, Some(segments_per_side));
            transform_ring(&mut ring, transform)?;
            if let Some(split_x) = split_x {
                reinterpret_to_be_east_of(split_x, &mut ring);
            }
            transformed = ring_envelope(&ring);
            transformed = buffer_minmax_envelope(transformed, 0.1);
        }
    }

    Ok(Envelope::new(
        wrap_lon(transformed.0),
        clamp_lat(transformed.1),
        wrap_lon(transformed.2),
        clamp_lat(transformed.3),
    ))
}

fn buffer_minmax_envelope(envelope: MinMaxEnvelope, buffer: f64) -> MinMaxEnvelope {
    (
        envelope.0 - buffer,
        (envelope.1 - buffer).max(-90.0),
        envelope.2 + buffer,
        (envelope.3 + buffer).min(90.0),
    )
}

// -------------------------------------------------------------------------------------------------
// union
// -------------------------------------------------------------------------------------------------
/// The union of two wrapped envelopes. Chooses the narrowest of the three
/// candidate unions (shifting the second by -360, 0, or +360 degrees); a
/// result at least 360 degrees wide collapses to the full-width envelope.
pub fn union_of_envelopes(env1: Option<Envelope>, env2: Option<Envelope>) -> Option<Envelope> {
    let env1 = match env1 {
        None => return env2,
        Some(env1) => env1,
    };
    let env2 = match env2 {
        None => return Some(env1),
        Some(env2) => env2,
    };

    let (w1, e1) = unwrap_lon_envelope(env1.w, env1.e);
    let (w2, e2) = unwrap_lon_envelope(env2.w, env2.e);
    let mut width = f64::INFINITY;
    let mut result_w = 0.0;
    let mut result_e = 0.0;

    for shift in [-360.0, 0.0, 360.0] {
        let potential_w = w1.min(w2 + shift);
        let potential_e = e1.max(e2 + shift);
        let potential_width = potential_e - potential_w;
        if potential_width < width {
            width = potential_width;
            result_w = potential_w;
            result_e = potential_e;
        }
    }

    let result_s = env1.s.min(env2.s);
    let result_n = env1.n.max(env2.n);
    if width >= 360.0 {
        Some(Envelope::new(-180.0, result_s, 180.0, result_n))
    } else {
        let (w, e) = wrap_lon_envelope(result_w, result_e);
        Some(Envelope::new(w, result_s, e, result_n))
    }
}
