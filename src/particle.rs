use crate::message::comm::Communicator;
use crate::patch::Real;




pub type ParticleId = usize;




/// Attributes of one particle at creation time.
#[derive(Clone, Copy, Debug)]
pub struct NewParticle {
    pub mass: Real,
    pub pos: [Real; 3],
    pub vel: [Real; 3],
    pub acc: [Real; 3],
    pub time: Real,
    pub metal_frac: Real,
    pub creation_time: Real,
}




/**
 * The per-rank particle repository, stored attribute-major so sweeps
 * over one attribute stay contiguous. Patches reference particles by
 * id; the repository itself is agnostic of the hierarchy. The global
 * active count is maintained by an explicit cross-rank reduction after
 * every injection sweep.
 */
#[derive(Default)]
pub struct ParticleRepo {
    pub mass: Vec<Real>,
    pub pos_x: Vec<Real>,
    pub pos_y: Vec<Real>,
    pub pos_z: Vec<Real>,
    pub vel_x: Vec<Real>,
    pub vel_y: Vec<Real>,
    pub vel_z: Vec<Real>,
    pub acc_x: Vec<Real>,
    pub acc_y: Vec<Real>,
    pub acc_z: Vec<Real>,
    pub time: Vec<Real>,
    pub metal_frac: Vec<Real>,
    pub creation_time: Vec<Real>,

    pub n_active_global: u64,
}




// ============================================================================
impl ParticleRepo {


    pub fn new() -> Self {
        Self::default()
    }


    pub fn n_active(&self) -> usize {
        self.mass.len()
    }


    /// Append one particle and return its id.
    pub fn add_one(&mut self, p: NewParticle) -> ParticleId {
        self.mass.push(p.mass);
        self.pos_x.push(p.pos[0]);
        self.pos_y.push(p.pos[1]);
        self.pos_z.push(p.pos[2]);
        self.vel_x.push(p.vel[0]);
        self.vel_y.push(p.vel[1]);
        self.vel_z.push(p.vel[2]);
        self.acc_x.push(p.acc[0]);
        self.acc_y.push(p.acc[1]);
        self.acc_z.push(p.acc[2]);
        self.time.push(p.time);
        self.metal_frac.push(p.metal_frac);
        self.creation_time.push(p.creation_time);
        self.mass.len() - 1
    }


    /// Reduce the active-particle count across all ranks.
    pub fn sync_global_count<C: Communicator + ?Sized>(&mut self, comm: &C) {
        let mine = (self.n_active() as u64).to_le_bytes().to_vec();
        let total = comm.all_reduce(
            |a, b| {
                let a = u64::from_le_bytes(a.try_into().unwrap());
                let b = u64::from_le_bytes(b.try_into().unwrap());
                (a + b).to_le_bytes().to_vec()
            },
            mine,
        );
        self.n_active_global = u64::from_le_bytes(total.try_into().unwrap());
    }
}




// ============================================================================
#[cfg(test)]
mod test {

    use super::*;
    use crate::message::local::local_group;
    use std::thread;

    #[test]
    fn ids_are_dense_and_stable() {
        let mut repo = ParticleRepo::new();
        let p = NewParticle {
            mass: 1.5,
            pos: [0.0, 1.0, 2.0],
            vel: [0.0; 3],
            acc: [0.0; 3],
            time: 0.0,
            metal_frac: 0.0,
            creation_time: 0.0,
        };
        assert_eq!(repo.add_one(p), 0);
        assert_eq!(repo.add_one(p), 1);
        assert_eq!(repo.n_active(), 2);
        assert_eq!(repo.pos_y[0], 1.0);
    }

    #[test]
    fn global_count_sums_over_ranks() {
        let group = local_group(3);
        let workers: Vec<_> = group
            .into_iter()
            .enumerate()
            .map(|(rank, comm)| {
                thread::spawn(move || {
                    let mut repo = ParticleRepo::new();
                    for _ in 0..rank + 1 {
                        repo.add_one(NewParticle {
                            mass: 1.0,
                            pos: [0.0; 3],
                            vel: [0.0; 3],
                            acc: [0.0; 3],
                            time: 0.0,
                            metal_frac: 0.0,
                            creation_time: 0.0,
                        });
                    }
                    repo.sync_global_count(&comm);
                    repo.n_active_global
                })
            })
            .collect();

        for worker in workers {
            assert_eq!(worker.join().unwrap(), 6);
        }
    }
}
