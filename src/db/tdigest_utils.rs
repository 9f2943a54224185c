//! Latency digest serialization.
//!
//! Hourly aggregate rows carry a t-digest of their latencies so that daily
//! rows can estimate a p95 without the raw runs. The blob uses the compact
//! go-tdigest "small encoding" (big-endian):
//! - 4 bytes: encoding version (always 2)
//! - 8 bytes: compression (float64)
//! - 4 bytes: number of centroids
//! - per centroid: 4 bytes delta-encoded mean (float32)
//! - per centroid: varint-encoded weight

use tdigests::{Centroid, TDigest};
use unsigned_varint::{decode as varint_decode, encode as varint_encode};

const SMALL_ENCODING: u32 = 2;

/// Maximum centroids kept per digest.
pub const DIGEST_COMPRESSION: usize = 100;

/// Build a digest blob from latency samples. Empty input yields an empty blob.
pub fn latency_digest(latencies_ms: &[f64]) -> Vec<u8> {
    if latencies_ms.is_empty() {
        return Vec::new();
    }
    let mut td = TDigest::from_values(latencies_ms.to_vec());
    td.compress(DIGEST_COMPRESSION);
    serialize_tdigest(&td)
}

/// Merge stored digest blobs into one digest. Blobs that fail to decode are skipped.
pub fn merge_latency_digests<'a, I>(blobs: I) -> Option<TDigest>
where
    I: IntoIterator<Item = &'a [u8]>,
{
    let mut centroids: Vec<Centroid> = Vec::new();
    for blob in blobs {
        if let Some(td) = deserialize_tdigest(blob) {
            centroids.extend(td.centroids().iter().map(|c| Centroid::new(c.mean, c.weight)));
        }
    }
    if centroids.is_empty() {
        return None;
    }
    centroids.sort_by(|a, b| a.mean.total_cmp(&b.mean));
    let mut td = TDigest::from_centroids(centroids);
    td.compress(DIGEST_COMPRESSION);
    Some(td)
}

/// Serialize a digest to bytes for storage.
pub fn serialize_tdigest(td: &TDigest) -> Vec<u8> {
    let centroids = td.centroids();
    let mut data = Vec::with_capacity(16 + centroids.len() * 6);

    data.extend_from_slice(&SMALL_ENCODING.to_be_bytes());
    data.extend_from_slice(&(DIGEST_COMPRESSION as f64).to_bits().to_be_bytes());
    data.extend_from_slice(&(centroids.len() as u32).to_be_bytes());

    let mut prev_mean = 0.0f64;
    for c in centroids {
        let delta = (c.mean - prev_mean) as f32;
        prev_mean = c.mean;
        data.extend_from_slice(&delta.to_bits().to_be_bytes());
    }

    let mut buf = varint_encode::u64_buffer();
    for c in centroids {
        // Weights are whole sample counts.
        let encoded = varint_encode::u64(c.weight.round() as u64, &mut buf);
        data.extend_from_slice(encoded);
    }

    data
}

/// Deserialize a digest from stored bytes.
pub fn deserialize_tdigest(data: &[u8]) -> Option<TDigest> {
    if data.len() < 16 {
        return None;
    }

    let encoding = u32::from_be_bytes(data[0..4].try_into().ok()?);
    if encoding != SMALL_ENCODING {
        return None;
    }
    let num_centroids = u32::from_be_bytes(data[12..16].try_into().ok()?) as usize;
    if num_centroids == 0 {
        return None;
    }

    let means_end = 16 + num_centroids * 4;
    if data.len() < means_end {
        return None;
    }

    let mut means = Vec::with_capacity(num_centroids);
    let mut cumulative = 0.0f64;
    for chunk in data[16..means_end].chunks_exact(4) {
        let delta = f32::from_bits(u32::from_be_bytes(chunk.try_into().ok()?));
        cumulative += delta as f64;
        means.push(cumulative);
    }

    let mut remaining = &data[means_end..];
    let mut centroids = Vec::with_capacity(num_centroids);
    for mean in means {
        let (weight, rest) = varint_decode::u64(remaining).ok()?;
        remaining = rest;
        centroids.push(Centroid::new(mean, weight as f64));
    }

    Some(TDigest::from_centroids(centroids))
}

/// Estimate the 95th percentile of a digest.
pub fn estimate_p95(td: &TDigest) -> f64 {
    td.estimate_quantile(0.95)
}
