//! Cross-resolution connectome reconstruction.
//!
//! A [`CrossCoder`] holds one encoder and one decoder MLP per parcellation,
//! all meeting in a shared latent space. Reconstruction encodes a connectome
//! from its source resolution and decodes it at the target resolution.

use std::io::{self, Cursor, Read, Write};
use std::path::Path;

use hashbrown::HashMap;
#[cfg(feature = "parallel")]
use rayon::prelude::*;

use crate::error::{SimError, SimResult};
use crate::parcellation::Parcellation;
use crate::prng::Prng;
use crate::storage;

pub const LATENT_DIM: usize = 16;
/// Encoder hidden widths, input side first. Decoders use the reverse.
pub const HIDDEN: [usize; 3] = [1024, 512, 128];

#[cfg(feature = "parallel")]
const PAR_MIN_WEIGHTS: usize = 1 << 16;

/// Produces a coupling vector at a fixed target resolution.
pub trait Reconstructor: Send + Sync {
    /// Region count of every vector this reconstructor returns.
    fn target_regions(&self) -> usize;

    fn reconstruct(&self, input: &[f64], source: Parcellation) -> SimResult<Vec<f64>>;
}

/// Fully-connected layer, weights stored `out × in` row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct Dense {
    in_dim: usize,
    out_dim: usize,
    weight: Vec<f32>,
    bias: Vec<f32>,
}

impl Dense {
    pub fn new(in_dim: usize, out_dim: usize, weight: Vec<f32>, bias: Vec<f32>) -> io::Result<Self> {
        if in_dim == 0 || out_dim == 0 {
            return Err(invalid("layer with zero width"));
        }
        if weight.len() != in_dim * out_dim || bias.len() != out_dim {
            return Err(invalid("layer parameter length mismatch"));
        }
        Ok(Self {
            in_dim,
            out_dim,
            weight,
            bias,
        })
    }

    /// Uniform(-1/sqrt(in), 1/sqrt(in)) for weights and bias.
    pub fn random(in_dim: usize, out_dim: usize, rng: &mut Prng) -> Self {
        let bound = 1.0 / (in_dim.max(1) as f64).sqrt();
        let mut draw = |n: usize| -> Vec<f32> {
            (0..n)
                .map(|_| rng.gen_range_f64(-bound, bound) as f32)
                .collect()
        };
        let weight = draw(in_dim * out_dim);
        let bias = draw(out_dim);
        Self {
            in_dim,
            out_dim,
            weight,
            bias,
        }
    }

    pub fn in_dim(&self) -> usize {
        self.in_dim
    }

    pub fn out_dim(&self) -> usize {
        self.out_dim
    }

    fn forward(&self, x: &[f32], out: &mut Vec<f32>) {
        out.clear();
        out.resize(self.out_dim, 0.0);

        let row_dot = |o: usize| -> f32 {
            let row = &self.weight[o * self.in_dim..(o + 1) * self.in_dim];
            self.bias[o] + row.iter().zip(x).map(|(w, xi)| w * xi).sum::<f32>()
        };

        #[cfg(feature = "parallel")]
        {
            if self.weight.len() >= PAR_MIN_WEIGHTS {
                out.par_iter_mut()
                    .enumerate()
                    .for_each(|(o, y)| *y = row_dot(o));
                return;
            }
        }

        for (o, y) in out.iter_mut().enumerate() {
            *y = row_dot(o);
        }
    }
}

/// Linear layers with ReLU between them (none after the last).
#[derive(Debug, Clone, PartialEq)]
pub struct Mlp {
    layers: Vec<Dense>,
}

impl Mlp {
    pub fn new(layers: Vec<Dense>) -> io::Result<Self> {
        if layers.is_empty() {
            return Err(invalid("mlp without layers"));
        }
        for pair in layers.windows(2) {
            if pair[0].out_dim != pair[1].in_dim {
                return Err(invalid("mlp layer widths do not chain"));
            }
        }
        Ok(Self { layers })
    }

    /// Random stack through the given widths, e.g. `[3403, 1024, 512, 128, 16]`.
    pub fn random(widths: &[usize], rng: &mut Prng) -> Self {
        let layers = widths
            .windows(2)
            .map(|w| Dense::random(w[0], w[1], rng))
            .collect();
        Self { layers }
    }

    pub fn in_dim(&self) -> usize {
        self.layers.first().map_or(0, Dense::in_dim)
    }

    pub fn out_dim(&self) -> usize {
        self.layers.last().map_or(0, Dense::out_dim)
    }

    pub fn layers(&self) -> &[Dense] {
        &self.layers
    }

    pub fn forward(&self, x: &[f32]) -> Vec<f32> {
        let mut cur = x.to_vec();
        let mut next = Vec::new();
        let last = self.layers.len().saturating_sub(1);
        for (idx, layer) in self.layers.iter().enumerate() {
            layer.forward(&cur, &mut next);
            if idx != last {
                for v in &mut next {
                    *v = v.max(0.0);
                }
            }
            std::mem::swap(&mut cur, &mut next);
        }
        cur
    }

    fn param_count(&self) -> usize {
        self.layers
            .iter()
            .map(|l| l.weight.len() + l.bias.len())
            .sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Encoder,
    Decoder,
}

impl Role {
    fn code(self) -> u8 {
        match self {
            Role::Encoder => 0,
            Role::Decoder => 1,
        }
    }

    fn from_code(code: u8) -> io::Result<Self> {
        match code {
            0 => Ok(Role::Encoder),
            1 => Ok(Role::Decoder),
            _ => Err(invalid("unknown branch role")),
        }
    }
}

/// Multi-resolution autoencoder used for inference only.
#[derive(Debug, Clone, PartialEq)]
pub struct CrossCoder {
    latent_dim: usize,
    target: Parcellation,
    encoders: HashMap<Parcellation, Mlp>,
    decoders: HashMap<Parcellation, Mlp>,
}

impl CrossCoder {
    pub fn new(latent_dim: usize, target: Parcellation) -> Self {
        Self {
            latent_dim,
            target,
            encoders: HashMap::new(),
            decoders: HashMap::new(),
        }
    }

    /// Randomly initialized branches for every listed parcellation.
    ///
    /// `hidden` lists encoder widths from the input side; decoders mirror it.
    pub fn with_random_weights(
        latent_dim: usize,
        hidden: &[usize],
        parcellations: &[Parcellation],
        target: Parcellation,
        rng: &mut Prng,
    ) -> Self {
        let mut coder = Self::new(latent_dim, target);
        for &p in parcellations {
            let mut widths = Vec::with_capacity(hidden.len() + 2);
            widths.push(p.edge_count());
            widths.extend_from_slice(hidden);
            widths.push(latent_dim);
            let encoder = Mlp::random(&widths, rng);
            widths.reverse();
            let decoder = Mlp::random(&widths, rng);
            coder.encoders.insert(p, encoder);
            coder.decoders.insert(p, decoder);
        }
        coder
    }

    pub fn latent_dim(&self) -> usize {
        self.latent_dim
    }

    pub fn target(&self) -> Parcellation {
        self.target
    }

    pub fn parcellations(&self) -> Vec<Parcellation> {
        let mut keys: Vec<Parcellation> = self.encoders.keys().copied().collect();
        keys.sort();
        keys
    }

    pub fn param_count(&self) -> usize {
        self.encoders
            .values()
            .chain(self.decoders.values())
            .map(Mlp::param_count)
            .sum()
    }

    pub fn insert_encoder(&mut self, p: Parcellation, mlp: Mlp) -> io::Result<()> {
        if mlp.in_dim() != p.edge_count() || mlp.out_dim() != self.latent_dim {
            return Err(invalid("encoder shape does not match parcellation/latent"));
        }
        self.encoders.insert(p, mlp);
        Ok(())
    }

    pub fn insert_decoder(&mut self, p: Parcellation, mlp: Mlp) -> io::Result<()> {
        if mlp.in_dim() != self.latent_dim || mlp.out_dim() != p.edge_count() {
            return Err(invalid("decoder shape does not match latent/parcellation"));
        }
        self.decoders.insert(p, mlp);
        Ok(())
    }

    pub fn encode(&self, input: &[f64], source: Parcellation) -> SimResult<Vec<f32>> {
        let encoder = self
            .encoders
            .get(&source)
            .ok_or_else(|| SimError::UnknownParcellation(source.key().to_string()))?;
        if input.len() != encoder.in_dim() {
            return Err(SimError::DimensionMismatch {
                expected: encoder.in_dim(),
                actual: input.len(),
            });
        }
        let x: Vec<f32> = input.iter().map(|&v| v as f32).collect();
        Ok(encoder.forward(&x))
    }

    pub fn decode(&self, latent: &[f32], target: Parcellation) -> SimResult<Vec<f64>> {
        let decoder = self.decoders.get(&target).ok_or_else(|| {
            SimError::ModelNotLoaded(format!("no decoder for {}", target.key()))
        })?;
        if latent.len() != decoder.in_dim() {
            return Err(SimError::DimensionMismatch {
                expected: decoder.in_dim(),
                actual: latent.len(),
            });
        }
        Ok(decoder.forward(latent).into_iter().map(f64::from).collect())
    }

    /// Serialize a versioned, chunked checkpoint image.
    ///
    /// Layout: magic, version, `CFG0` (raw), then one `MLP0` chunk per branch
    /// with an LZ4-compressed payload.
    pub fn save_image_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(storage::MAGIC)?;
        storage::write_u32_le(w, storage::VERSION_CURRENT)?;

        w.write_all(b"CFG0")?;
        storage::write_u32_le(w, 8)?;
        storage::write_u32_le(w, self.latent_dim as u32)?;
        storage::write_u32_le(w, self.target.regions() as u32)?;

        for (role, map) in [(Role::Encoder, &self.encoders), (Role::Decoder, &self.decoders)] {
            let mut keys: Vec<&Parcellation> = map.keys().collect();
            keys.sort();
            for p in keys {
                let payload = Self::mlp_payload(role, *p, &map[p])?;
                storage::write_chunk_lz4(w, *b"MLP0", &payload)?;
            }
        }
        Ok(())
    }

    /// Load a checkpoint image. Unknown chunks are skipped.
    pub fn load_image_from<R: Read>(r: &mut R) -> io::Result<Self> {
        let magic = storage::read_exact::<8, _>(r)?;
        if &magic != storage::MAGIC {
            return Err(invalid("bad crosscoder image magic"));
        }
        let version = storage::read_u32_le(r)?;
        if version != storage::VERSION_V1 {
            return Err(invalid("unsupported crosscoder image version"));
        }

        let mut coder: Option<CrossCoder> = None;
        let mut branches: Vec<(Role, Parcellation, Mlp)> = Vec::new();

        loop {
            let (tag, len) = match storage::read_chunk_header(r) {
                Ok(v) => v,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e),
            };

            let mut take = r.take(len as u64);
            match &tag {
                b"CFG0" => {
                    let latent_dim = storage::read_u32_le(&mut take)? as usize;
                    let target_regions = storage::read_u32_le(&mut take)? as usize;
                    let target = Parcellation::from_regions(target_regions)
                        .ok_or_else(|| invalid("unknown target parcellation"))?;
                    coder = Some(CrossCoder::new(latent_dim, target));
                }
                b"MLP0" => {
                    let payload = storage::read_chunk_lz4_payload(&mut take, len)?;
                    branches.push(Self::read_mlp_payload(&payload)?);
                }
                _ => {}
            }
            io::copy(&mut take, &mut io::sink())?;
        }

        let mut coder = coder.ok_or_else(|| invalid("missing CFG0"))?;
        for (role, p, mlp) in branches {
            match role {
                Role::Encoder => coder.insert_encoder(p, mlp)?,
                Role::Decoder => coder.insert_decoder(p, mlp)?,
            }
        }
        if !coder.decoders.contains_key(&coder.target) {
            return Err(invalid("missing decoder for target parcellation"));
        }
        Ok(coder)
    }

    pub fn load_from_path(path: &Path) -> io::Result<Self> {
        let file = std::fs::File::open(path)?;
        Self::load_image_from(&mut io::BufReader::new(file))
    }

    pub fn save_to_path(&self, path: &Path) -> io::Result<()> {
        let file = std::fs::File::create(path)?;
        let mut w = io::BufWriter::new(file);
        self.save_image_to(&mut w)?;
        w.flush()
    }

    /// Exact serialized size in bytes.
    pub fn image_size_bytes(&self) -> io::Result<usize> {
        let mut cw = storage::CountingWriter::new();
        self.save_image_to(&mut cw)?;
        Ok(cw.written())
    }

    fn mlp_payload(role: Role, p: Parcellation, mlp: &Mlp) -> io::Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(16 + 4 * mlp.param_count());
        buf.push(role.code());
        storage::write_u32_le(&mut buf, p.regions() as u32)?;
        storage::write_u32_le(&mut buf, mlp.layers.len() as u32)?;
        for layer in &mlp.layers {
            storage::write_u32_le(&mut buf, layer.in_dim as u32)?;
            storage::write_u32_le(&mut buf, layer.out_dim as u32)?;
            for &w in &layer.weight {
                storage::write_f32_le(&mut buf, w)?;
            }
            for &b in &layer.bias {
                storage::write_f32_le(&mut buf, b)?;
            }
        }
        Ok(buf)
    }

    fn read_mlp_payload(payload: &[u8]) -> io::Result<(Role, Parcellation, Mlp)> {
        let mut r = Cursor::new(payload);
        let role = Role::from_code(storage::read_exact::<1, _>(&mut r)?[0])?;
        let regions = storage::read_u32_le(&mut r)? as usize;
        let p = Parcellation::from_regions(regions)
            .ok_or_else(|| invalid("unknown branch parcellation"))?;
        let n_layers = storage::read_u32_le(&mut r)? as usize;

        let mut layers = Vec::with_capacity(n_layers.min(64));
        for _ in 0..n_layers {
            let in_dim = storage::read_u32_le(&mut r)? as usize;
            let out_dim = storage::read_u32_le(&mut r)? as usize;
            let n_weights = in_dim
                .checked_mul(out_dim)
                .ok_or_else(|| invalid("layer too large"))?;
            // Reject sizes the remaining payload cannot hold before allocating.
            let remaining = payload.len() - r.position() as usize;
            if (n_weights + out_dim).saturating_mul(4) > remaining {
                return Err(invalid("layer truncated"));
            }
            let weight = (0..n_weights)
                .map(|_| storage::read_f32_le(&mut r))
                .collect::<io::Result<Vec<f32>>>()?;
            let bias = (0..out_dim)
                .map(|_| storage::read_f32_le(&mut r))
                .collect::<io::Result<Vec<f32>>>()?;
            layers.push(Dense::new(in_dim, out_dim, weight, bias)?);
        }
        Ok((role, p, Mlp::new(layers)?))
    }
}

impl Reconstructor for CrossCoder {
    fn target_regions(&self) -> usize {
        self.target.regions()
    }

    fn reconstruct(&self, input: &[f64], source: Parcellation) -> SimResult<Vec<f64>> {
        let latent = self.encode(input, source)?;
        self.decode(&latent, self.target)
    }
}

fn invalid(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny(target: Parcellation) -> CrossCoder {
        let mut rng = Prng::new(5);
        CrossCoder::with_random_weights(4, &[8], &[Parcellation::P86, target], target, &mut rng)
    }

    #[test]
    fn dense_forward_matches_hand_computation() {
        let layer = Dense::new(2, 2, vec![1.0, 2.0, -1.0, 0.5], vec![0.5, 0.0]).unwrap();
        let mut out = Vec::new();
        layer.forward(&[1.0, 3.0], &mut out);
        assert_eq!(out, vec![7.5, 0.5]);
    }

    #[test]
    fn relu_only_between_layers() {
        let a = Dense::new(1, 1, vec![-1.0], vec![0.0]).unwrap();
        let b = Dense::new(1, 1, vec![1.0], vec![-2.0]).unwrap();
        let mlp = Mlp::new(vec![a, b]).unwrap();
        // Hidden activation clamps to 0; the output keeps its negative bias.
        assert_eq!(mlp.forward(&[3.0]), vec![-2.0]);
    }

    #[test]
    fn mismatched_layers_are_rejected() {
        assert!(Dense::new(2, 2, vec![0.0; 3], vec![0.0; 2]).is_err());
        let a = Dense::new(2, 3, vec![0.0; 6], vec![0.0; 3]).unwrap();
        let b = Dense::new(2, 1, vec![0.0; 2], vec![0.0; 1]).unwrap();
        assert!(Mlp::new(vec![a, b]).is_err());
        assert!(Mlp::new(Vec::new()).is_err());
    }

    #[test]
    fn reconstruct_produces_target_length() {
        let coder = tiny(Parcellation::P129);
        let input = vec![0.1; Parcellation::P86.edge_count()];
        let out = coder.reconstruct(&input, Parcellation::P86).unwrap();
        assert_eq!(out.len(), Parcellation::P129.edge_count());
        assert_eq!(coder.target_regions(), 129);
        assert!(out.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn reconstruct_rejects_bad_input() {
        let coder = tiny(Parcellation::P86);
        let err = coder.reconstruct(&[0.0; 10], Parcellation::P86).unwrap_err();
        assert_eq!(
            err,
            SimError::DimensionMismatch {
                expected: 3403,
                actual: 10
            }
        );
        let err = coder
            .reconstruct(&[0.0; 27261], Parcellation::P234)
            .unwrap_err();
        assert_eq!(err, SimError::UnknownParcellation("parc_234".into()));
    }

    #[test]
    fn image_roundtrip() {
        let coder = tiny(Parcellation::P129);
        let mut bytes = Vec::new();
        coder.save_image_to(&mut bytes).unwrap();
        assert_eq!(bytes.len(), coder.image_size_bytes().unwrap());

        let loaded = CrossCoder::load_image_from(&mut Cursor::new(bytes)).unwrap();
        assert_eq!(loaded, coder);
        assert_eq!(
            loaded.parcellations(),
            vec![Parcellation::P86, Parcellation::P129]
        );
    }

    #[test]
    fn bad_images_are_rejected() {
        let mut cursor = Cursor::new(b"NOTMAGIC\x01\x00\x00\x00".to_vec());
        assert!(CrossCoder::load_image_from(&mut cursor).is_err());

        // Header only: no CFG0.
        let mut bytes = storage::MAGIC.to_vec();
        bytes.extend_from_slice(&storage::VERSION_V1.to_le_bytes());
        assert!(CrossCoder::load_image_from(&mut Cursor::new(bytes.clone())).is_err());

        // CFG0 without the target decoder.
        bytes.extend_from_slice(b"CFG0");
        bytes.extend_from_slice(&8u32.to_le_bytes());
        bytes.extend_from_slice(&4u32.to_le_bytes());
        bytes.extend_from_slice(&86u32.to_le_bytes());
        assert!(CrossCoder::load_image_from(&mut Cursor::new(bytes)).is_err());
    }
}
