use crate::geometry::{morton3, side, unit_disp, Side};
use crate::patch::PATCH_SIZE;




/**
 * The static partition of the domain: ranks form a 3-D grid over the
 * root-level patches, each rank owning an equal rectangular sub-box at
 * every refinement level. The decomposition answers three questions
 * for the rest of the core: which rank neighbors mine in each of the
 * 26 directions, which rank owns a given patch position, and how a
 * position maps to a space-filling-curve key for the load-balance
 * planner variant.
 */
#[derive(Clone, Debug)]
pub struct DomainDecomp {
    pub rank_dims: [usize; 3],
    pub my_coord: [usize; 3],
    pub periodic: [bool; 3],
    pub n_root: [usize; 3],
    pub max_level: usize,
}




// ============================================================================
impl DomainDecomp {


    pub fn new(
        rank: usize,
        rank_dims: [usize; 3],
        periodic: [bool; 3],
        n_root: [usize; 3],
        max_level: usize,
    ) -> Self {
        for a in 0..3 {
            assert!(
                n_root[a] % rank_dims[a] == 0,
                "root grid must divide evenly into the rank grid"
            );
        }
        let my_coord = [
            rank % rank_dims[0],
            (rank / rank_dims[0]) % rank_dims[1],
            rank / (rank_dims[0] * rank_dims[1]),
        ];
        Self {
            rank_dims,
            my_coord,
            periodic,
            n_root,
            max_level,
        }
    }


    pub fn num_ranks(&self) -> usize {
        self.rank_dims[0] * self.rank_dims[1] * self.rank_dims[2]
    }


    pub fn rank_of_coord(&self, coord: [usize; 3]) -> usize {
        coord[0] + self.rank_dims[0] * (coord[1] + self.rank_dims[1] * coord[2])
    }


    pub fn my_rank(&self) -> usize {
        self.rank_of_coord(self.my_coord)
    }


    /// Extent of one patch at level `lv`, in deepest-level cell units.
    pub fn patch_scale(&self, lv: usize) -> i64 {
        (PATCH_SIZE as i64) << (self.max_level - lv)
    }


    /// Extent of the whole domain per axis, in deepest-level cell units.
    pub fn domain_scale(&self, axis: usize) -> i64 {
        self.n_root[axis] as i64 * self.patch_scale(0)
    }


    /**
     * The rank adjacent to mine in sibling direction `dir`, or `None`
     * when the direction leaves the rank grid through a non-periodic
     * boundary. With a single rank along a periodic axis the sibling
     * is this rank itself, and the exchange engine short-circuits the
     * transport for that pair.
     */
    pub fn sibling_rank(&self, dir: usize) -> Option<usize> {
        let step = unit_disp(dir);
        let mut coord = [0usize; 3];

        for a in 0..3 {
            let c = self.my_coord[a] as i64 + step[a];
            let n = self.rank_dims[a] as i64;
            coord[a] = if (0..n).contains(&c) {
                c as usize
            } else if self.periodic[a] {
                c.rem_euclid(n) as usize
            } else {
                return None;
            };
        }
        Some(self.rank_of_coord(coord))
    }


    /// Low corner of this rank's sub-box, in deepest-level cell units.
    pub fn my_box_low(&self) -> [i64; 3] {
        let mut low = [0i64; 3];
        for a in 0..3 {
            let per_rank = (self.n_root[a] / self.rank_dims[a]) as i64;
            low[a] = self.my_coord[a] as i64 * per_rank * self.patch_scale(0);
        }
        low
    }


    /// High corner (exclusive) of this rank's sub-box.
    pub fn my_box_high(&self) -> [i64; 3] {
        let low = self.my_box_low();
        let mut high = [0i64; 3];
        for a in 0..3 {
            let per_rank = (self.n_root[a] / self.rank_dims[a]) as i64;
            high[a] = low[a] + per_rank * self.patch_scale(0);
        }
        high
    }


    /// Map a possibly-unwrapped corner back into the domain.
    pub fn wrap_corner(&self, corner: [i64; 3]) -> [i64; 3] {
        let mut wrapped = corner;
        for a in 0..3 {
            if self.periodic[a] {
                wrapped[a] = wrapped[a].rem_euclid(self.domain_scale(a));
            }
        }
        wrapped
    }


    /// Whether the (wrapped) corner lies inside the domain.
    pub fn corner_in_domain(&self, corner: [i64; 3]) -> bool {
        (0..3).all(|a| (0..self.domain_scale(a)).contains(&corner[a]))
    }


    /// The rank owning the patch whose (wrapped) corner is given.
    pub fn owner_of_corner(&self, corner: [i64; 3]) -> usize {
        let mut coord = [0usize; 3];
        for a in 0..3 {
            let per_rank = (self.n_root[a] / self.rank_dims[a]) as i64 * self.patch_scale(0);
            coord[a] = (corner[a] / per_rank) as usize;
        }
        self.rank_of_coord(coord)
    }


    /**
     * Classify an unwrapped corner against my sub-box: the sibling
     * direction it lies in, or `None` when it is inside the box. The
     * classification is per-axis; edge and corner directions arise when
     * two or three axes are off-box.
     */
    pub fn direction_of_corner(&self, corner: [i64; 3]) -> Option<usize> {
        let low = self.my_box_low();
        let high = self.my_box_high();
        let mut sides = [Side::Mid; 3];
        for a in 0..3 {
            sides[a] = if corner[a] < low[a] {
                Side::Minus
            } else if corner[a] >= high[a] {
                Side::Plus
            } else {
                Side::Mid
            };
        }
        if sides == [Side::Mid; 3] {
            return None;
        }
        (0..crate::geometry::NUM_SIBLING).find(|&d| (0..3).all(|a| side(d, a) == sides[a]))
    }


    /**
     * Space-filling-curve key of the patch at `corner` (wrapped) on
     * level `lv`: the Morton interleave of its patch coordinates. All
     * ranks compute the identical key from the identical corner, which
     * is the only property the planner and the GID machinery rely on.
     */
    pub fn lb_key(&self, lv: usize, corner: [i64; 3]) -> i64 {
        let wrapped = self.wrap_corner(corner);
        let ps = self.patch_scale(lv);
        morton3(
            (wrapped[0] / ps) as u64,
            (wrapped[1] / ps) as u64,
            (wrapped[2] / ps) as u64,
        )
    }
}




// ============================================================================
#[cfg(test)]
mod test {

    use super::*;

    fn two_rank_decomp(rank: usize) -> DomainDecomp {
        DomainDecomp::new(rank, [2, 1, 1], [true, true, true], [4, 2, 2], 1)
    }

    #[test]
    fn sibling_ranks_wrap_periodically() {
        let decomp = two_rank_decomp(0);
        assert_eq!(decomp.sibling_rank(0), Some(1)); // -x wraps
        assert_eq!(decomp.sibling_rank(1), Some(1));
        assert_eq!(decomp.sibling_rank(2), Some(0)); // -y is myself
    }

    #[test]
    fn non_periodic_boundary_has_no_sibling() {
        let decomp = DomainDecomp::new(0, [2, 1, 1], [false, true, true], [4, 2, 2], 1);
        assert_eq!(decomp.sibling_rank(0), None);
        assert_eq!(decomp.sibling_rank(1), Some(1));
    }

    #[test]
    fn ownership_follows_the_rank_grid() {
        let decomp = two_rank_decomp(0);
        // patch scale at root = 16; rank 0 owns x in [0, 32)
        assert_eq!(decomp.owner_of_corner([0, 0, 0]), 0);
        assert_eq!(decomp.owner_of_corner([32, 0, 0]), 1);
    }

    #[test]
    fn corner_classification() {
        let decomp = two_rank_decomp(0);
        assert_eq!(decomp.direction_of_corner([0, 0, 0]), None);
        assert_eq!(decomp.direction_of_corner([-16, 0, 0]), Some(0));
        assert_eq!(decomp.direction_of_corner([32, 0, 0]), Some(1));
        assert_eq!(decomp.direction_of_corner([32, -16, 0]), Some(7));
    }

    #[test]
    fn lb_keys_are_rank_independent() {
        let d0 = two_rank_decomp(0);
        let d1 = two_rank_decomp(1);
        assert_eq!(d0.lb_key(0, [48, 16, 0]), d1.lb_key(0, [48, 16, 0]));
        assert_eq!(d0.lb_key(0, [-16, 0, 0]), d0.lb_key(0, [48, 0, 0]));
    }
}
