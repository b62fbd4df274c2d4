use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::RuntimeConfig;
use crate::error::{AmrError, Result};
use crate::geometry::{mirror, unit_disp, NUM_SIBLING};
use crate::hierarchy::{GlobalIndex, Hierarchy, PatchClass};
use crate::message::comm::Communicator;
use crate::patch::{
    PatchId, Real, Son, DENS, ENGY, METAL, MOMX, MOMY, MOMZ, NCOMP_TOTAL, NFLUX, PATCH_SIZE,
    POT_GHOST,
};




/// Bump on every schema change; the loader refuses anything newer.
pub const FORMAT_VERSION: i32 = 3;

/// Sentinel for an absent tree link (no father, no son, no sibling).
pub const GID_NONE: i64 = -1;

/// Sibling sentinel base for directions that leave the domain through a
/// non-periodic boundary: the stored value is `GID_BOUNDARY - dir`.
pub const GID_BOUNDARY: i64 = -100;




/**
 * The `Info` group: everything needed to interpret the rest of the
 * file without consulting the producing build.
 */
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KeyInfo {
    pub format_version: i32,
    pub model: String,
    pub num_levels: usize,
    pub patch_size: usize,
    pub dump_id: u32,
    pub step: Vec<u64>,
    pub time: Vec<f64>,
    pub cell_size: Vec<f64>,
    pub n_patches: Vec<usize>,
    pub code_version: String,
    pub wall_clock_unix: u64,
}


/// Build-time switches of the producing binary.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MakefileOptions {
    pub model: String,
    pub gravity: bool,
    pub star_formation: bool,
    pub float8: bool,
    pub debug: bool,
}


/// Symbolic compile-time constants the data layout depends on.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SymConst {
    pub ncomp_total: usize,
    pub nflux: usize,
    pub patch_size: usize,
    pub pot_ghost: usize,
    pub num_sibling: usize,
}


/**
 * The `Tree` group, every array indexed by GID. `cvt2phy` converts the
 * integer corners to physical coordinates: it is the cell size at the
 * deepest level.
 */
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TreeData {
    pub lb_idx: Vec<i64>,
    pub corner: Vec<[i64; 3]>,
    pub cvt2phy: f64,
    pub father: Vec<i64>,
    pub son: Vec<i64>,
    pub sibling: Vec<[i64; NUM_SIBLING]>,
}


/**
 * One checkpoint: a single self-describing hierarchical file. `data`
 * holds one flattened `(N_total, PS, PS, PS)` dataset per field, laid
 * out by GID so a patch at a deeper level always sits at a larger
 * index.
 */
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub key_info: KeyInfo,
    pub makefile: MakefileOptions,
    pub sym_const: SymConst,
    pub input_para: RuntimeConfig,
    pub tree: TreeData,
    pub data: BTreeMap<String, Vec<Real>>,
}




fn field_list(config: &RuntimeConfig) -> Vec<(&'static str, FieldSource)> {
    let mut fields = vec![
        ("Dens", FieldSource::Fluid(DENS)),
        ("MomX", FieldSource::Fluid(MOMX)),
        ("MomY", FieldSource::Fluid(MOMY)),
        ("MomZ", FieldSource::Fluid(MOMZ)),
        ("Engy", FieldSource::Fluid(ENGY)),
        ("Metal", FieldSource::Fluid(METAL)),
    ];
    if config.gravity_type.has_self() {
        fields.push(("Pote", FieldSource::Pot));
    }
    fields
}


#[derive(Clone, Copy)]
enum FieldSource {
    Fluid(usize),
    Pot,
}




// ============================================================================
// writing


/**
 * Dump the full state of the hierarchy into one file. The file is
 * written serially across ranks: rank 0 creates the structure with
 * zero-filled datasets, then each rank in turn reopens the file, writes
 * its hyperslab for every field at every level, and closes it again;
 * a barrier separates the turns because the file must be closed before
 * the next rank may append. All ranks participate in the collective
 * global-index computation up front.
 */
pub fn dump<C: Communicator + ?Sized>(
    hier: &Hierarchy,
    comm: &C,
    dump_id: u32,
    path: &Path,
) -> Result<()> {
    let gidx = hier.global_index(comm);

    if comm.rank() == 0 {
        let snapshot = skeleton(hier, &gidx, dump_id);
        write_file(path, &snapshot)?;
    }

    for turn in 0..comm.size() {
        comm.barrier();
        if turn == comm.rank() {
            let mut snapshot = read_file(path)?;
            fill_hyperslab(hier, &gidx, &mut snapshot)?;
            write_file(path, &snapshot)?;
        }
    }
    comm.barrier();

    #[cfg(debug_assertions)]
    if comm.rank() == 0 {
        verify_tree(&read_file(path)?)?;
    }
    Ok(())
}


fn skeleton(hier: &Hierarchy, gidx: &GlobalIndex, dump_id: u32) -> Snapshot {
    let config = &hier.config;
    let total = gidx.total_patches();

    let key_info = KeyInfo {
        format_version: FORMAT_VERSION,
        model: config.model.name().to_string(),
        num_levels: config.num_levels(),
        patch_size: PATCH_SIZE,
        dump_id,
        step: hier.step.clone(),
        time: hier.time.clone(),
        cell_size: (0..config.num_levels()).map(|lv| config.cell_size(lv)).collect(),
        n_patches: gidx.n_total.clone(),
        code_version: env!("CARGO_PKG_VERSION").to_string(),
        wall_clock_unix: std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0),
    };

    let makefile = MakefileOptions {
        model: config.model.name().to_string(),
        gravity: config.gravity_type.has_self(),
        star_formation: config.star_formation.is_some(),
        float8: std::mem::size_of::<Real>() == 8,
        debug: cfg!(debug_assertions),
    };

    let sym_const = SymConst {
        ncomp_total: NCOMP_TOTAL,
        nflux: NFLUX,
        patch_size: PATCH_SIZE,
        pot_ghost: POT_GHOST,
        num_sibling: NUM_SIBLING,
    };

    let tree = TreeData {
        lb_idx: vec![GID_NONE; total],
        corner: vec![[0; 3]; total],
        cvt2phy: config.cell_size_finest(),
        father: vec![GID_NONE; total],
        son: vec![GID_NONE; total],
        sibling: vec![[GID_NONE; NUM_SIBLING]; total],
    };

    let data = field_list(config)
        .iter()
        .map(|(name, _)| {
            (
                name.to_string(),
                vec![0.0; total * PATCH_SIZE * PATCH_SIZE * PATCH_SIZE],
            )
        })
        .collect();

    Snapshot {
        key_info,
        makefile,
        sym_const,
        input_para: config.clone(),
        tree,
        data,
    }
}


fn fill_hyperslab(hier: &Hierarchy, gidx: &GlobalIndex, snapshot: &mut Snapshot) -> Result<()> {
    let fields = field_list(&hier.config);

    for lv in 0..hier.num_levels() {
        let flu_sg = hier.flu_sg[lv];
        let pot_sg = hier.pot_sg[lv];

        for &id in hier.real_ids(lv) {
            let patch = hier.patch(lv, id);
            let gid = gidx
                .gid_of_key(lv, patch.lb_idx)
                .ok_or_else(|| AmrError::Checkpoint(format!("key of patch {} missing", id)))?
                as usize;

            snapshot.tree.lb_idx[gid] = patch.lb_idx;
            snapshot.tree.corner[gid] = patch.corner;
            snapshot.tree.father[gid] = father_gid(hier, gidx, lv, patch.corner);
            snapshot.tree.son[gid] = son_gid(hier, gidx, lv, id);
            snapshot.tree.sibling[gid] = sibling_gids(hier, gidx, lv, patch.corner);

            for (name, source) in &fields {
                let dataset = snapshot.data.get_mut(*name).expect("skeleton has all fields");
                let base = gid * PATCH_SIZE * PATCH_SIZE * PATCH_SIZE;
                for k in 0..PATCH_SIZE {
                    for j in 0..PATCH_SIZE {
                        for i in 0..PATCH_SIZE {
                            let value = match source {
                                FieldSource::Fluid(v) => {
                                    patch.fluid[flu_sg].as_deref().map_or(0.0, |c| c[*v][k][j][i])
                                }
                                FieldSource::Pot => {
                                    patch.pot[pot_sg].as_deref().map_or(0.0, |c| c[k][j][i])
                                }
                            };
                            dataset[base + (k * PATCH_SIZE + j) * PATCH_SIZE + i] = value;
                        }
                    }
                }
            }
        }
    }
    Ok(())
}


fn father_gid(hier: &Hierarchy, gidx: &GlobalIndex, lv: usize, corner: [i64; 3]) -> i64 {
    if lv == 0 {
        return GID_NONE;
    }
    let span = hier.decomp.patch_scale(lv - 1);
    let father_corner = [
        corner[0].div_euclid(span) * span,
        corner[1].div_euclid(span) * span,
        corner[2].div_euclid(span) * span,
    ];
    let key = hier.decomp.lb_key(lv - 1, father_corner);
    gidx.gid_of_key(lv - 1, key).unwrap_or(GID_NONE)
}


fn son_gid(hier: &Hierarchy, gidx: &GlobalIndex, lv: usize, id: PatchId) -> i64 {
    let patch = hier.patch(lv, id);
    if !patch.son.exists() {
        return GID_NONE;
    }
    // the first son shares the father's low corner; its key resolves
    // even when the sons live on another rank
    let key = hier.decomp.lb_key(lv + 1, patch.corner);
    gidx.gid_of_key(lv + 1, key).unwrap_or(GID_NONE)
}


fn sibling_gids(
    hier: &Hierarchy,
    gidx: &GlobalIndex,
    lv: usize,
    corner: [i64; 3],
) -> [i64; NUM_SIBLING] {
    let span = hier.decomp.patch_scale(lv);
    let mut gids = [GID_NONE; NUM_SIBLING];

    for (d, gid) in gids.iter_mut().enumerate() {
        let step = unit_disp(d);
        let mut neighbor = corner;
        let mut outside = false;
        for a in 0..3 {
            neighbor[a] += step[a] * span;
            if !hier.config.periodic[a]
                && (neighbor[a] < 0 || neighbor[a] >= hier.decomp.domain_scale(a))
            {
                outside = true;
            }
        }
        *gid = if outside {
            GID_BOUNDARY - d as i64
        } else {
            let key = hier.decomp.lb_key(lv, neighbor);
            gidx.gid_of_key(lv, key).unwrap_or(GID_NONE)
        };
    }
    gids
}


fn write_file(path: &Path, snapshot: &Snapshot) -> Result<()> {
    let file = File::create(path)
        .map_err(|e| AmrError::Checkpoint(format!("create {}: {}", path.display(), e)))?;
    let mut writer = BufWriter::new(file);
    ciborium::ser::into_writer(snapshot, &mut writer)
        .map_err(|e| AmrError::Checkpoint(format!("encode {}: {}", path.display(), e)))
}


fn read_file(path: &Path) -> Result<Snapshot> {
    let file = File::open(path)
        .map_err(|e| AmrError::Checkpoint(format!("open {}: {}", path.display(), e)))?;
    ciborium::de::from_reader(BufReader::new(file))
        .map_err(|e| AmrError::Checkpoint(format!("decode {}: {}", path.display(), e)))
}




// ============================================================================
// loading


/**
 * Rebuild a hierarchy from a checkpoint, under a possibly different
 * rank count: each rank creates exactly the real patches its partition
 * owns, in GID order (which keeps the eight sons of a father in
 * consecutive arena slots), wires the father/son links, and finally
 * resynchronizes the halo level by level.
 */
pub fn load<C: Communicator + ?Sized>(
    path: &Path,
    comm: &C,
    rank_dims: [usize; 3],
) -> Result<Hierarchy> {
    let snapshot = read_file(path)?;
    if snapshot.key_info.format_version > FORMAT_VERSION {
        return Err(AmrError::Checkpoint(format!(
            "format version {} is newer than this build ({})",
            snapshot.key_info.format_version, FORMAT_VERSION
        )));
    }

    let mut config = snapshot.input_para.clone();
    config.rank_dims = rank_dims;
    let mut hier = Hierarchy::new(config, comm.rank());
    hier.time = snapshot.key_info.time.clone();
    hier.step = snapshot.key_info.step.clone();

    let fields = field_list(&hier.config);
    let mut local_of_gid: HashMap<i64, (usize, PatchId)> = HashMap::new();

    // pass 1: create this rank's real patches, level by level, GID order
    let mut gid = 0usize;
    for lv in 0..hier.num_levels() {
        for _ in 0..snapshot.key_info.n_patches[lv] {
            let corner = snapshot.tree.corner[gid];
            if hier.decomp.owner_of_corner(corner) == comm.rank() {
                let id = hier.allocate_patch(lv, corner, PatchClass::Real);
                local_of_gid.insert(gid as i64, (lv, id));

                let patch = hier.patch_mut(lv, id);
                for (name, source) in &fields {
                    let dataset = &snapshot.data[*name];
                    let base = gid * PATCH_SIZE * PATCH_SIZE * PATCH_SIZE;
                    for k in 0..PATCH_SIZE {
                        for j in 0..PATCH_SIZE {
                            for i in 0..PATCH_SIZE {
                                let value = dataset[base + (k * PATCH_SIZE + j) * PATCH_SIZE + i];
                                match source {
                                    FieldSource::Fluid(v) => {
                                        if let Some(c) = patch.fluid[0].as_deref_mut() {
                                            c[*v][k][j][i] = value;
                                        }
                                    }
                                    FieldSource::Pot => {
                                        if let Some(c) = patch.pot[0].as_deref_mut() {
                                            c[k][j][i] = value;
                                        }
                                    }
                                }
                            }
                        }
                    }
                }
            }
            gid += 1;
        }
    }

    // pass 2: father/son links from the tree arrays
    for (&gid, &(lv, id)) in &local_of_gid {
        let son = snapshot.tree.son[gid as usize];
        if son != GID_NONE {
            if let Some(&(_, first)) = local_of_gid.get(&son) {
                hier.patch_mut(lv, id).son = Son::Local(first);
            }
        }
        let father = snapshot.tree.father[gid as usize];
        if father != GID_NONE {
            if let Some(&(_, father_id)) = local_of_gid.get(&father) {
                hier.patch_mut(lv, id).father = Some(father_id);
            }
        }
    }

    for lv in 0..hier.num_levels() {
        hier.link_all(lv);
        crate::buffer::sync_buffers(&mut hier, comm, lv);
    }
    Ok(hier)
}




// ============================================================================
// verification


/**
 * Cross-verify the tree arrays of a finished dump: every refined patch
 * must be the father of its eight Morton-consecutive sons, and every
 * sibling link must be mirrored. Debug builds run this on rank 0 after
 * the last hyperslab lands.
 */
pub fn verify_tree(snapshot: &Snapshot) -> Result<()> {
    let tree = &snapshot.tree;
    let total = tree.father.len();

    for gid in 0..total {
        let son = tree.son[gid];
        if son != GID_NONE {
            for c in 0..8 {
                let child = (son + c) as usize;
                if child >= total || tree.father[child] != gid as i64 {
                    return Err(AmrError::Invariant(format!(
                        "tree dump: father of GID {} is not {}",
                        son + c,
                        gid
                    )));
                }
            }
        }
        for d in 0..NUM_SIBLING {
            let sib = tree.sibling[gid][d];
            if sib >= 0 {
                let back = tree.sibling[sib as usize][mirror(d)];
                if back != gid as i64 && sib != gid as i64 {
                    return Err(AmrError::Invariant(format!(
                        "tree dump: sibling reciprocity broken at GID {} dir {}",
                        gid, d
                    )));
                }
            }
        }
    }
    Ok(())
}




// ============================================================================
#[cfg(test)]
mod test {

    use super::*;
    use crate::message::local::local_group;
    use std::thread;

    fn scratch_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("magnetar-{}-{}", std::process::id(), name))
    }

    /**
     * A three-level hierarchy every rank layout can reproduce: refine
     * the whole root grid (so level 1 covers the domain and nesting is
     * trivially proper), then refine the level-1 patch at the origin.
     * Halo synchronization is collective, so every rank takes part in
     * every `sync_buffers` even when it refined nothing.
     */
    fn build_refined<C: Communicator + ?Sized>(
        rank: usize,
        rank_dims: [usize; 3],
        comm: &C,
    ) -> Hierarchy {
        let config = RuntimeConfig {
            box_size: 16.0,
            n_root: [2, 2, 2],
            max_level: 2,
            rank_dims,
            ..RuntimeConfig::default()
        };
        let mut hier = Hierarchy::new(config, rank);
        hier.build_root();
        crate::buffer::sync_buffers(&mut hier, comm, 0);

        let roots: Vec<PatchId> = hier.real_ids(0).to_vec();
        for id in roots {
            hier.refine(0, id).unwrap();
        }
        crate::buffer::sync_buffers(&mut hier, comm, 0);
        crate::buffer::sync_buffers(&mut hier, comm, 1);

        if let Some(id) = hier.id_at_corner(1, [0, 0, 0]) {
            if hier.real_ids(1).contains(&id) {
                hier.refine(1, id).unwrap();
            }
        }
        crate::buffer::sync_buffers(&mut hier, comm, 1);
        crate::buffer::sync_buffers(&mut hier, comm, 2);

        for lv in 0..hier.num_levels() {
            let ids: Vec<_> = hier.real_ids(lv).to_vec();
            for id in ids {
                let corner = hier.patch(lv, id).corner;
                if let Some(cube) = hier.patch_mut(lv, id).fluid[0].as_deref_mut() {
                    for k in 0..PATCH_SIZE {
                        for j in 0..PATCH_SIZE {
                            for i in 0..PATCH_SIZE {
                                cube[DENS][k][j][i] = (lv + 1) as Real * 100.0
                                    + corner[0] as Real
                                    + (i + 10 * j) as Real;
                            }
                        }
                    }
                }
            }
        }
        hier
    }

    #[test]
    fn round_trip_preserves_every_field() {
        let path = scratch_path("round-trip");
        let group = local_group(1);
        let hier = build_refined(0, [1, 1, 1], &group[0]);

        dump(&hier, &group[0], 0, &path).unwrap();
        let reloaded = load(&path, &group[0], [1, 1, 1]).unwrap();

        let path2 = scratch_path("round-trip-2");
        dump(&reloaded, &group[0], 0, &path2).unwrap();

        let mut a = read_file(&path).unwrap();
        let mut b = read_file(&path2).unwrap();
        // the wall clock legitimately differs between the two dumps
        a.key_info.wall_clock_unix = 0;
        b.key_info.wall_clock_unix = 0;
        assert_eq!(a, b);

        std::fs::remove_file(&path).ok();
        std::fs::remove_file(&path2).ok();
    }

    #[test]
    fn rank_counts_agree_on_the_gid_mapping() {
        let path1 = scratch_path("one-rank");
        let path2 = scratch_path("two-rank");

        {
            let group = local_group(1);
            let hier = build_refined(0, [1, 1, 1], &group[0]);
            dump(&hier, &group[0], 0, &path1).unwrap();
        }
        {
            let group = local_group(2);
            let path2 = path2.clone();
            let workers: Vec<_> = group
                .into_iter()
                .enumerate()
                .map(|(rank, comm)| {
                    let path2 = path2.clone();
                    thread::spawn(move || {
                        let hier = build_refined(rank, [2, 1, 1], &comm);
                        dump(&hier, &comm, 0, &path2).unwrap();
                    })
                })
                .collect();
            for worker in workers {
                worker.join().unwrap();
            }
        }

        let mut a = read_file(&path1).unwrap();
        let mut b = read_file(&path2).unwrap();
        a.key_info.wall_clock_unix = 0;
        b.key_info.wall_clock_unix = 0;
        // rank layout is configuration, not state; mask it like the clock
        a.input_para.rank_dims = [0; 3];
        b.input_para.rank_dims = [0; 3];
        assert_eq!(a, b);

        std::fs::remove_file(&path1).ok();
        std::fs::remove_file(&path2).ok();
    }

    #[test]
    fn newer_formats_are_refused() {
        let path = scratch_path("future");
        let group = local_group(1);
        let hier = build_refined(0, [1, 1, 1], &group[0]);
        dump(&hier, &group[0], 0, &path).unwrap();

        let mut snapshot = read_file(&path).unwrap();
        snapshot.key_info.format_version = FORMAT_VERSION + 1;
        write_file(&path, &snapshot).unwrap();

        assert!(load(&path, &group[0], [1, 1, 1]).is_err());
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn tree_verification_catches_broken_links() {
        let path = scratch_path("broken");
        let group = local_group(1);
        let hier = build_refined(0, [1, 1, 1], &group[0]);
        dump(&hier, &group[0], 0, &path).unwrap();

        let mut snapshot = read_file(&path).unwrap();
        verify_tree(&snapshot).unwrap();
        let sib = snapshot.tree.sibling[0][0];
        if sib >= 0 {
            snapshot.tree.sibling[sib as usize][mirror(0)] = GID_NONE;
            assert!(verify_tree(&snapshot).is_err());
        }
        std::fs::remove_file(&path).ok();
    }
}
