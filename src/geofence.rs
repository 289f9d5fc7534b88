use tracing::warn;

/// Approximate km per degree of latitude.
const KM_PER_DEG_LAT: f64 = 111.0;
/// Approximate km per degree of longitude at the operating region's latitude.
const KM_PER_DEG_LON: f64 = 95.0;

/// Plausibility check for reported fixes against an operational bounding box.
#[derive(Debug, Clone, Copy)]
pub struct Geofence {
    lat_min: f64,
    lat_max: f64,
    lon_min: f64,
    lon_max: f64,
    buffer_km: f64,
}

impl Geofence {
    pub fn new(lat_min: f64, lat_max: f64, lon_min: f64, lon_max: f64, buffer_km: f64) -> Self {
        Self {
            lat_min,
            lat_max,
            lon_min,
            lon_max,
            buffer_km,
        }
    }

    /// Returns true when the fix is plausible. Rejects (0,0) as "no fix",
    /// mathematically invalid coordinates as spoofing/corruption, and anything
    /// outside the bounding box expanded by the buffer distance.
    pub fn validate(&self, lat: f64, lon: f64) -> bool {
        if lat == 0.0 && lon == 0.0 {
            warn!("no GPS fix, coordinates are (0, 0)");
            return false;
        }

        if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
            warn!(lat, lon, "invalid coordinates, possible spoofing");
            return false;
        }

        let lat_buffer = self.buffer_km / KM_PER_DEG_LAT;
        let lon_buffer = self.buffer_km / KM_PER_DEG_LON;

        let in_box = lat >= self.lat_min - lat_buffer
            && lat <= self.lat_max + lat_buffer
            && lon >= self.lon_min - lon_buffer
            && lon <= self.lon_max + lon_buffer;

        if !in_box {
            warn!(
                lat,
                lon,
                buffer_km = self.buffer_km,
                "coordinates outside operating region"
            );
            return false;
        }

        true
    }
}
