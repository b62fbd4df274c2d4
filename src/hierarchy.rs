use std::collections::HashMap;

use crate::config::RuntimeConfig;
use crate::domain::DomainDecomp;
use crate::error::{AmrError, Result};
use crate::geometry::{child_offset, mirror, unit_disp, NUM_SIBLING};
use crate::message::comm::Communicator;
use crate::patch::{Patch, PatchId, Sandglass, SibLink, Son, NCOMP_TOTAL, PATCH_SIZE};
use crate::plan::LevelPlan;




/**
 * Patch classes inside a level's ordered id table. Real patches always
 * precede buffer patches; the cumulative `comma` table records the
 * class boundaries so sweeps can address "reals only" or "reals plus
 * buffers" by range.
 */
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PatchClass {
    Real = 0,
    SibBuffer = 1,
    CoarseBuffer = 2,
}

pub const NUM_CLASS: usize = 3;




/**
 * One refinement level: an arena of patch slots plus the ordered,
 * class-partitioned id table. Ids are stable for the lifetime of a
 * patch; sons are always allocated as eight consecutive slots so that
 * `son + local_id` addressing works, and freed octets are recycled as
 * whole octets.
 */
pub struct Level {
    slots: Vec<Option<Patch>>,
    free_single: Vec<PatchId>,
    free_octet: Vec<PatchId>,
    ids: Vec<PatchId>,
    comma: [usize; NUM_CLASS + 1],
    corner_index: HashMap<[i64; 3], PatchId>,
}


impl Level {
    fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_single: Vec::new(),
            free_octet: Vec::new(),
            ids: Vec::new(),
            comma: [0; NUM_CLASS + 1],
            corner_index: HashMap::new(),
        }
    }
}




/**
 * The AMR hierarchy owned by one rank: per-level patch tables, the
 * static domain decomposition, the per-level sandglass and time state,
 * and the exchange plans produced by the sibling planner. All global
 * mutable state of the core lives here; sub-systems receive the
 * hierarchy (or a narrow view of it) by explicit parameter.
 */
pub struct Hierarchy {
    pub config: RuntimeConfig,
    pub decomp: DomainDecomp,
    levels: Vec<Level>,

    /// Active fluid sandglass per level.
    pub flu_sg: Vec<Sandglass>,
    /// Active potential sandglass per level.
    pub pot_sg: Vec<Sandglass>,
    /// Physical time per level.
    pub time: Vec<f64>,
    /// Step counter per level.
    pub step: Vec<u64>,

    /// Whether coarse-fine flux registers are maintained at all.
    pub with_flux: bool,

    /// Classical exchange plans, one per level.
    pub plans: Vec<LevelPlan>,
    /// Load-balance exchange plans, one per level.
    pub plans_lb: Vec<LevelPlan>,
}




// ============================================================================
impl Hierarchy {


    pub fn new(config: RuntimeConfig, rank: usize) -> Self {
        let decomp = DomainDecomp::new(
            rank,
            config.rank_dims,
            config.periodic,
            config.n_root,
            config.max_level,
        );
        let num_levels = config.num_levels();
        let with_flux = config.fixup_flux;

        Self {
            config,
            decomp,
            levels: (0..num_levels).map(|_| Level::new()).collect(),
            flu_sg: vec![0; num_levels],
            pot_sg: vec![0; num_levels],
            time: vec![0.0; num_levels],
            step: vec![0; num_levels],
            with_flux,
            plans: (0..num_levels).map(|_| LevelPlan::default()).collect(),
            plans_lb: (0..num_levels).map(|_| LevelPlan::default()).collect(),
        }
    }


    pub fn num_levels(&self) -> usize {
        self.levels.len()
    }


    pub fn max_level(&self) -> usize {
        self.config.max_level
    }




    // ------------------------------------------------------------------------
    // lookup


    pub fn patch(&self, lv: usize, id: PatchId) -> &Patch {
        self.get(lv, id)
            .unwrap_or_else(|| panic!("no patch {} at level {}", id, lv))
    }


    pub fn patch_mut(&mut self, lv: usize, id: PatchId) -> &mut Patch {
        self.get_mut(lv, id)
            .unwrap_or_else(|| panic!("no patch {} at level {}", id, lv))
    }


    pub fn get(&self, lv: usize, id: PatchId) -> Option<&Patch> {
        self.levels.get(lv)?.slots.get(id)?.as_ref()
    }


    pub fn get_mut(&mut self, lv: usize, id: PatchId) -> Option<&mut Patch> {
        self.levels.get_mut(lv)?.slots.get_mut(id)?.as_mut()
    }


    /// Ids of the real patches at `lv`, in table order.
    pub fn real_ids(&self, lv: usize) -> &[PatchId] {
        let level = &self.levels[lv];
        &level.ids[..level.comma[1]]
    }


    /// Ids of the buffer patches at `lv` (all buffer classes).
    pub fn buffer_ids(&self, lv: usize) -> &[PatchId] {
        let level = &self.levels[lv];
        &level.ids[level.comma[1]..]
    }


    /// Ids of every patch at `lv`, reals first.
    pub fn all_ids(&self, lv: usize) -> &[PatchId] {
        &self.levels[lv].ids
    }


    pub fn n_real(&self, lv: usize) -> usize {
        self.levels[lv].comma[1]
    }


    /// The cumulative class-boundary table of a level.
    pub fn comma(&self, lv: usize) -> [usize; NUM_CLASS + 1] {
        self.levels[lv].comma
    }


    pub fn id_at_corner(&self, lv: usize, corner: [i64; 3]) -> Option<PatchId> {
        self.levels[lv].corner_index.get(&corner).copied()
    }


    /// Direct (mutable) access to a level's slot array, for parallel
    /// sweeps that index patches by slot.
    pub fn slots_mut(&mut self, lv: usize) -> &mut [Option<Patch>] {
        &mut self.levels[lv].slots
    }




    // ------------------------------------------------------------------------
    // allocation


    fn make_patch(&self, lv: usize, corner: [i64; 3]) -> Patch {
        let lb_idx = self.decomp.lb_key(lv, corner);
        let mut patch = Patch::new(lv, corner, lb_idx);
        patch.allocate_fluid();
        if self.config.gravity_type.has_self() {
            patch.allocate_pot();
        }
        patch
    }


    fn insert_id(&mut self, lv: usize, id: PatchId, class: PatchClass) {
        let level = &mut self.levels[lv];
        let position = level.comma[class as usize + 1];
        level.ids.insert(position, id);
        for boundary in (class as usize + 1)..=NUM_CLASS {
            level.comma[boundary] += 1;
        }
    }


    fn take_single_slot(&mut self, lv: usize) -> PatchId {
        let level = &mut self.levels[lv];
        if let Some(id) = level.free_single.pop() {
            id
        } else {
            level.slots.push(None);
            level.slots.len() - 1
        }
    }


    /**
     * Allocate one patch of the given class at `corner` (unwrapped for
     * buffer patches). Fields are allocated according to the configured
     * gravity mode; siblings are left unlinked.
     */
    pub fn allocate_patch(&mut self, lv: usize, corner: [i64; 3], class: PatchClass) -> PatchId {
        let patch = self.make_patch(lv, corner);
        let id = self.take_single_slot(lv);
        let level = &mut self.levels[lv];
        level.slots[id] = Some(patch);
        level.corner_index.insert(corner, id);
        self.insert_id(lv, id, class);
        id
    }


    /**
     * Release one patch: drop its owned buffers, unlink it from the
     * sibling table of its neighbors and remove it from the id table.
     * Father/son links must have been cleared by the caller (refine and
     * derefine own that bookkeeping).
     */
    pub fn free_patch(&mut self, lv: usize, id: PatchId) {
        let corner = self.patch(lv, id).corner;
        for d in 0..NUM_SIBLING {
            if let SibLink::Patch(sib) = self.patch(lv, id).sibling[d] {
                self.patch_mut(lv, sib).sibling[mirror(d)] = SibLink::Unallocated;
            }
        }
        let level = &mut self.levels[lv];
        level.corner_index.remove(&corner);
        let position = level.ids.iter().position(|&p| p == id).expect("id in table");
        level.ids.remove(position);
        for boundary in 1..=NUM_CLASS {
            if level.comma[boundary] > position {
                level.comma[boundary] -= 1;
            }
        }
        level.slots[id] = None;
        level.free_single.push(id);
    }


    /// Drop every buffer patch at `lv`. Used when the halo structure is
    /// rebuilt after a (de)refinement pass.
    pub fn clear_buffers(&mut self, lv: usize) {
        while self.levels[lv].ids.len() > self.levels[lv].comma[1] {
            let id = *self.levels[lv].ids.last().unwrap();
            self.free_patch(lv, id);
        }
    }




    // ------------------------------------------------------------------------
    // sibling linking


    /**
     * Resolve the neighbor of a patch at `corner` in direction `d`:
     * the link target id, an outside-boundary marker, or none. Periodic
     * neighbors that wrap back onto this rank's real patches are linked
     * directly; remote periodic images resolve through the unwrapped
     * corner a buffer patch was registered under.
     */
    fn resolve_sibling(&self, lv: usize, corner: [i64; 3], d: usize) -> SibLink {
        let scale = self.decomp.patch_scale(lv);
        let step = unit_disp(d);
        let mut neighbor = corner;
        for a in 0..3 {
            neighbor[a] += step[a] * scale;
        }

        let mut in_domain = true;
        for a in 0..3 {
            if neighbor[a] < 0 || neighbor[a] >= self.decomp.domain_scale(a) {
                if !self.config.periodic[a] {
                    return SibLink::OutsideBoundary;
                }
                in_domain = false;
            }
        }

        if let Some(id) = self.levels[lv].corner_index.get(&neighbor) {
            return SibLink::Patch(*id);
        }
        if !in_domain {
            let wrapped = self.decomp.wrap_corner(neighbor);
            if let Some(id) = self.levels[lv].corner_index.get(&wrapped) {
                return SibLink::Patch(*id);
            }
        }
        SibLink::Unallocated
    }


    /// Link one patch into the sibling tables, both directions.
    pub fn link_patch(&mut self, lv: usize, id: PatchId) {
        let corner = self.patch(lv, id).corner;
        for d in 0..NUM_SIBLING {
            let link = self.resolve_sibling(lv, corner, d);
            self.patch_mut(lv, id).sibling[d] = link;
            if let SibLink::Patch(sib) = link {
                if sib != id {
                    self.patch_mut(lv, sib).sibling[mirror(d)] = SibLink::Patch(id);
                }
            }
        }
    }


    pub fn link_all(&mut self, lv: usize) {
        let ids: Vec<PatchId> = self.levels[lv].ids.clone();
        for id in ids {
            self.link_patch(lv, id);
        }
    }




    // ------------------------------------------------------------------------
    // root construction


    /**
     * Create this rank's real root patches, one per root-grid position
     * inside the rank's sub-box, and link their siblings. Buffer
     * patches are created afterwards by the halo synchronization.
     */
    pub fn build_root(&mut self) {
        let scale = self.decomp.patch_scale(0);
        let low = self.decomp.my_box_low();
        let high = self.decomp.my_box_high();

        let mut z = low[2];
        while z < high[2] {
            let mut y = low[1];
            while y < high[1] {
                let mut x = low[0];
                while x < high[0] {
                    self.allocate_patch(0, [x, y, z], PatchClass::Real);
                    x += scale;
                }
                y += scale;
            }
            z += scale;
        }
        self.link_all(0);
        self.refresh_flux_registers(0);
    }




    // ------------------------------------------------------------------------
    // refinement


    /**
     * Refine one real patch: allocate its eight Morton-ordered sons in
     * consecutive slots, fill their fields by conservative injection
     * from the father, link them into the fine-level sibling table, and
     * re-derive the flux registers around the new coarse-fine surface.
     *
     * Proper nesting requires every face neighbor of the refined patch
     * to exist at its level; debug builds verify this.
     */
    pub fn refine(&mut self, lv: usize, id: PatchId) -> Result<PatchId> {
        if lv >= self.max_level() {
            return Err(AmrError::Precondition {
                name: "refine level",
                value: lv as i64,
            });
        }
        if self.patch(lv, id).son.exists() {
            return Err(AmrError::Precondition {
                name: "son",
                value: id as i64,
            });
        }
        #[cfg(debug_assertions)]
        for face in 0..6 {
            if self.patch(lv, id).sibling[face] == SibLink::Unallocated {
                return Err(AmrError::Invariant(format!(
                    "proper nesting: face {} of patch {} at level {} has no neighbor",
                    face, id, lv
                )));
            }
        }

        let son_scale = self.decomp.patch_scale(lv + 1);
        let father_corner = self.patch(lv, id).corner;

        // eight consecutive slots, recycled as whole octets
        let first = if let Some(first) = self.levels[lv + 1].free_octet.pop() {
            first
        } else {
            let first = self.levels[lv + 1].slots.len();
            self.levels[lv + 1].slots.resize_with(first + 8, || None);
            first
        };

        for c in 0..8 {
            let offset = child_offset(c);
            let corner = [
                father_corner[0] + offset[0] * son_scale,
                father_corner[1] + offset[1] * son_scale,
                father_corner[2] + offset[2] * son_scale,
            ];
            let mut son = self.make_patch(lv + 1, corner);
            son.father = Some(id);
            self.fill_son_by_injection(lv, id, &mut son, offset);
            let son_id = first + c;
            self.levels[lv + 1].slots[son_id] = Some(son);
            self.levels[lv + 1].corner_index.insert(corner, son_id);
            self.insert_id(lv + 1, son_id, PatchClass::Real);
        }
        for c in 0..8 {
            self.link_patch(lv + 1, first + c);
        }
        self.patch_mut(lv, id).son = Son::Local(first);

        self.refresh_registers_around(lv, id);
        for c in 0..8 {
            self.refresh_registers_around(lv + 1, first + c);
        }
        Ok(first)
    }


    /**
     * Delete the eight sons of a refined patch and restore the flux
     * registers of the re-exposed coarse faces. The sons must be leaves
     * (derefinement proceeds deepest level first).
     */
    pub fn derefine(&mut self, lv: usize, id: PatchId) -> Result<()> {
        let first = match self.patch(lv, id).son {
            Son::Local(first) => first,
            _ => {
                return Err(AmrError::Precondition {
                    name: "son",
                    value: -1,
                })
            }
        };
        for c in 0..8 {
            if self.patch(lv + 1, first + c).son.exists() {
                return Err(AmrError::Invariant(format!(
                    "derefine of patch {} at level {} with refined son {}",
                    id,
                    lv,
                    first + c
                )));
            }
        }

        let mut son_neighbors = Vec::new();
        for c in 0..8 {
            for d in 0..NUM_SIBLING {
                if let SibLink::Patch(sib) = self.patch(lv + 1, first + c).sibling[d] {
                    if sib < first || sib >= first + 8 {
                        son_neighbors.push(sib);
                    }
                }
            }
        }

        for c in 0..8 {
            self.free_patch(lv + 1, first + c);
        }
        self.levels[lv + 1].free_octet.push(first);
        // free_patch pushed the ids onto the single list as well; undo that
        let level = &mut self.levels[lv + 1];
        level.free_single.retain(|&p| p < first || p >= first + 8);

        self.patch_mut(lv, id).son = Son::None;

        self.refresh_registers_around(lv, id);
        for sib in son_neighbors {
            if self.get(lv + 1, sib).is_some() {
                self.refresh_registers_around(lv + 1, sib);
            }
        }
        Ok(())
    }


    /**
     * Conservative injection: every fine cell inherits the value of the
     * coarse cell it subdivides, so the block average of the eight sons
     * reproduces the father exactly.
     */
    fn fill_son_by_injection(&self, lv: usize, father: PatchId, son: &mut Patch, offset: [i64; 3]) {
        let father = self.patch(lv, father);
        let ox = offset[0] as usize * PATCH_SIZE / 2;
        let oy = offset[1] as usize * PATCH_SIZE / 2;
        let oz = offset[2] as usize * PATCH_SIZE / 2;

        for sg in 0..2 {
            if let (Some(src), Some(dst)) = (father.fluid[sg].as_deref(), son.fluid[sg].as_deref_mut()) {
                for v in 0..NCOMP_TOTAL {
                    for k in 0..PATCH_SIZE {
                        for j in 0..PATCH_SIZE {
                            for i in 0..PATCH_SIZE {
                                dst[v][k][j][i] = src[v][oz + k / 2][oy + j / 2][ox + i / 2];
                            }
                        }
                    }
                }
            }
            if let (Some(src), Some(dst)) = (father.pot[sg].as_deref(), son.pot[sg].as_deref_mut()) {
                for k in 0..PATCH_SIZE {
                    for j in 0..PATCH_SIZE {
                        for i in 0..PATCH_SIZE {
                            dst[k][j][i] = src[oz + k / 2][oy + j / 2][ox + i / 2];
                        }
                    }
                }
            }
        }
    }




    // ------------------------------------------------------------------------
    // flux registers


    /**
     * Re-derive the flux registers of one patch from the allocation
     * rule: a register exists on face `f` iff the patch is a leaf and
     * its face-`f` neighbor is refined. Registers that remain allocated
     * keep their accumulated contents.
     */
    pub fn refresh_flux_registers_of(&mut self, lv: usize, id: PatchId) {
        if !self.with_flux {
            return;
        }
        for face in 0..6 {
            let should = !self.patch(lv, id).son.exists()
                && match self.patch(lv, id).sibling[face] {
                    SibLink::Patch(sib) => self.patch(lv, sib).son.exists(),
                    _ => false,
                };
            let patch = self.patch_mut(lv, id);
            if should {
                patch.allocate_flux(face);
            } else {
                patch.free_flux(face);
            }
        }
    }


    fn refresh_registers_around(&mut self, lv: usize, id: PatchId) {
        self.refresh_flux_registers_of(lv, id);
        for face in 0..6 {
            if let SibLink::Patch(sib) = self.patch(lv, id).sibling[face] {
                self.refresh_flux_registers_of(lv, sib);
            }
        }
    }


    pub fn refresh_flux_registers(&mut self, lv: usize) {
        let ids: Vec<PatchId> = self.levels[lv].ids.clone();
        for id in ids {
            self.refresh_flux_registers_of(lv, id);
        }
    }




    // ------------------------------------------------------------------------
    // sandglass and time


    pub fn flip_flu_sg(&mut self, lv: usize) {
        self.flu_sg[lv] = 1 - self.flu_sg[lv];
    }


    pub fn flip_pot_sg(&mut self, lv: usize) {
        self.pot_sg[lv] = 1 - self.pot_sg[lv];
    }




    // ------------------------------------------------------------------------
    // global ids


    /**
     * Compute the deterministic global patch index: all level-0 patches
     * first, then level 1 and so on, each level sorted by its
     * space-filling-curve keys. Every rank derives the identical map
     * from the allgathered per-level key lists, so the function is pure
     * given the hierarchy state.
     */
    pub fn global_index<C: Communicator + ?Sized>(&self, comm: &C) -> GlobalIndex {
        let mut sorted_keys = Vec::with_capacity(self.num_levels());
        let mut n_total = Vec::with_capacity(self.num_levels());
        let mut level_offset = Vec::with_capacity(self.num_levels());
        let mut offset = 0i64;

        for lv in 0..self.num_levels() {
            let mine: Vec<i64> = self
                .real_ids(lv)
                .iter()
                .map(|&id| self.patch(lv, id).lb_idx)
                .collect();
            let encoded = rmp_serde::to_vec(&mine).expect("key list encodes");
            let gathered = comm.all_gather(encoded);

            let mut keys: Vec<i64> = Vec::new();
            for bytes in gathered {
                let part: Vec<i64> = rmp_serde::from_slice(&bytes).expect("key list decodes");
                keys.extend(part);
            }
            keys.sort_unstable();

            level_offset.push(offset);
            offset += keys.len() as i64;
            n_total.push(keys.len());
            sorted_keys.push(keys);
        }

        GlobalIndex {
            n_total,
            level_offset,
            sorted_keys,
        }
    }




    // ------------------------------------------------------------------------
    // invariants


    /**
     * Verify sibling reciprocity, father-son reciprocity, proper
     * nesting and the flux-register allocation rule over the whole
     * hierarchy. Debug builds call this after structural mutations;
     * release builds may call it explicitly (e.g. periodically from a
     * driver).
     */
    pub fn verify_invariants(&self) -> Result<()> {
        for lv in 0..self.num_levels() {
            for &id in self.all_ids(lv) {
                let patch = self.patch(lv, id);

                for d in 0..NUM_SIBLING {
                    if let SibLink::Patch(sib) = patch.sibling[d] {
                        let back = self.patch(lv, sib).sibling[mirror(d)];
                        if back != SibLink::Patch(id) && sib != id {
                            return Err(AmrError::Invariant(format!(
                                "sibling reciprocity broken: level {} patch {} dir {}",
                                lv, id, d
                            )));
                        }
                    }
                }

                if let Son::Local(first) = patch.son {
                    for c in 0..8 {
                        let son = self.get(lv + 1, first + c).ok_or_else(|| {
                            AmrError::Invariant(format!(
                                "missing son {} of level {} patch {}",
                                first + c,
                                lv,
                                id
                            ))
                        })?;
                        if son.father != Some(id) {
                            return Err(AmrError::Invariant(format!(
                                "father-son reciprocity broken: level {} patch {}",
                                lv, id
                            )));
                        }
                    }
                    for face in 0..6 {
                        if patch.sibling[face] == SibLink::Unallocated {
                            return Err(AmrError::Invariant(format!(
                                "proper nesting broken: level {} patch {} face {}",
                                lv, id, face
                            )));
                        }
                    }
                }

                if self.with_flux {
                    for face in 0..6 {
                        let should = !patch.son.exists()
                            && match patch.sibling[face] {
                                SibLink::Patch(sib) => self.patch(lv, sib).son.exists(),
                                _ => false,
                            };
                        if should != patch.flux[face].is_some() {
                            return Err(AmrError::Invariant(format!(
                                "flux register allocation broken: level {} patch {} face {}",
                                lv, id, face
                            )));
                        }
                    }
                }
            }
        }
        Ok(())
    }
}




/**
 * The pure global-id map: per-level totals, level offsets, and the
 * globally sorted key list of each level. A patch's GID is its level
 * offset plus the rank of its key in the sorted list; the same function
 * answers "which GID does the patch at this corner have" for tree
 * serialization, including patches owned by other ranks.
 */
pub struct GlobalIndex {
    pub n_total: Vec<usize>,
    pub level_offset: Vec<i64>,
    pub sorted_keys: Vec<Vec<i64>>,
}


impl GlobalIndex {
    pub fn total_patches(&self) -> usize {
        self.n_total.iter().sum()
    }

    pub fn gid_of_key(&self, lv: usize, key: i64) -> Option<i64> {
        self.sorted_keys[lv]
            .binary_search(&key)
            .ok()
            .map(|position| self.level_offset[lv] + position as i64)
    }
}
