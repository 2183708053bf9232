/// Version-based write-skew detection performed at prepare time.
pub mod detection;
