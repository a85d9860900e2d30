mod aggregate;
mod extract;
mod fingerprint;
mod record;

pub use aggregate::{FingerprintRow, ProgramRow, SurfaceAggregator, SurfaceObservation};
pub use extract::{
    best_stable_delta, changed_mints, extract_surface, jito_tip, owner_mint_deltas, programs,
    OwnerMintDeltas, StableDelta, SurfaceExtract, TipSummary,
};
pub use fingerprint::{fingerprint, interesting_programs};
pub use record::{assemble_record, AssembledRecord};
