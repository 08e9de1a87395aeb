use rand::seq::SliceRandom;
use rand::Rng;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StudentRef {
    pub id: String,
    pub filiere: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupSpec {
    pub size: usize,
    pub mixed: bool,
}

/// Ordered groups; every input student lands in exactly one of them.
pub type Partition = Vec<Vec<StudentRef>>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PartitionError {
    #[error("no students to partition")]
    EmptyInput,
    #[error("group size must be at least 2 (got {0})")]
    InvalidSize(usize),
}

impl PartitionError {
    pub fn code(&self) -> &'static str {
        match self {
            PartitionError::EmptyInput => "empty_roster",
            PartitionError::InvalidSize(_) => "invalid_group_size",
        }
    }
}

pub fn group_count(n: usize, size: usize) -> usize {
    n / size + usize::from(n % size > 0)
}

/// Splits `students` into groups of roughly `spec.size`.
///
/// Plain mode shuffles everyone and slices consecutive chunks, so only the
/// last group can be short. Mixed mode shuffles each field of study on its
/// own and deals member `i` of every field into bucket `i % num_groups`.
/// Bucket totals are not equalized when field sizes are uneven, and buckets
/// left empty by that dealing are dropped.
pub fn partition<R>(
    students: &[StudentRef],
    spec: GroupSpec,
    rng: &mut R,
) -> Result<Partition, PartitionError>
where
    R: Rng + ?Sized,
{
    if students.is_empty() {
        return Err(PartitionError::EmptyInput);
    }
    if spec.size < 2 {
        return Err(PartitionError::InvalidSize(spec.size));
    }

    if spec.mixed {
        Ok(partition_mixed(students, spec.size, rng))
    } else {
        Ok(partition_random(students, spec.size, rng))
    }
}

fn partition_random<R>(students: &[StudentRef], size: usize, rng: &mut R) -> Partition
where
    R: Rng + ?Sized,
{
    let mut pool = students.to_vec();
    pool.shuffle(rng);
    pool.chunks(size).map(|c| c.to_vec()).collect()
}

fn partition_mixed<R>(students: &[StudentRef], size: usize, rng: &mut R) -> Partition
where
    R: Rng + ?Sized,
{
    // Fields keep the order in which they first show up in the roster.
    let mut by_field: Vec<(&str, Vec<StudentRef>)> = Vec::new();
    for s in students {
        match by_field.iter_mut().find(|(f, _)| *f == s.filiere.as_str()) {
            Some((_, members)) => members.push(s.clone()),
            None => by_field.push((s.filiere.as_str(), vec![s.clone()])),
        }
    }
    for (_, members) in by_field.iter_mut() {
        members.shuffle(rng);
    }

    let num_groups = group_count(students.len(), size);
    let mut buckets: Partition = vec![Vec::new(); num_groups];
    for (_, members) in by_field {
        for (i, s) in members.into_iter().enumerate() {
            buckets[i % num_groups].push(s);
        }
    }

    buckets.retain(|b| !b.is_empty());
    buckets
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use std::collections::HashSet;

    fn roster(fields: &[(&str, usize)]) -> Vec<StudentRef> {
        let mut out = Vec::new();
        for (field, count) in fields {
            for i in 0..*count {
                out.push(StudentRef {
                    id: format!("{}-{}", field, i),
                    filiere: field.to_string(),
                });
            }
        }
        out
    }

    fn assert_is_partition(students: &[StudentRef], groups: &Partition) {
        let total: usize = groups.iter().map(|g| g.len()).sum();
        assert_eq!(total, students.len());
        assert!(groups.iter().all(|g| !g.is_empty()));
        let ids: HashSet<&str> = groups.iter().flatten().map(|s| s.id.as_str()).collect();
        assert_eq!(ids.len(), students.len());
    }

    #[test]
    fn plain_mode_slices_ten_into_four_four_two() {
        let students = roster(&[("informatique", 10)]);
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let groups = partition(&students, GroupSpec { size: 4, mixed: false }, &mut rng)
            .expect("partition");
        let sizes: Vec<usize> = groups.iter().map(|g| g.len()).collect();
        assert_eq!(sizes, vec![4, 4, 2]);
        assert_is_partition(&students, &groups);
    }

    #[test]
    fn plain_mode_holds_for_a_range_of_sizes() {
        let mut rng = ChaCha8Rng::seed_from_u64(99);
        for n in 1..=23 {
            let students = roster(&[("physique", n)]);
            for size in 2..=6 {
                let groups =
                    partition(&students, GroupSpec { size, mixed: false }, &mut rng).expect("partition");
                assert_eq!(groups.len(), group_count(n, size));
                for g in &groups[..groups.len() - 1] {
                    assert_eq!(g.len(), size);
                }
                assert_is_partition(&students, &groups);
            }
        }
    }

    #[test]
    fn mixed_mode_deals_each_field_round_robin() {
        let students = roster(&[("A", 5), ("B", 4)]);
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let groups = partition(&students, GroupSpec { size: 3, mixed: true }, &mut rng)
            .expect("partition");
        assert_eq!(groups.len(), 3);
        assert_is_partition(&students, &groups);

        // A lands at [0,1,2,0,1] and B at [0,1,2,0].
        let count = |g: &Vec<StudentRef>, f: &str| g.iter().filter(|s| s.filiere == f).count();
        let per_bucket: Vec<(usize, usize)> =
            groups.iter().map(|g| (count(g, "A"), count(g, "B"))).collect();
        assert_eq!(per_bucket, vec![(2, 2), (2, 1), (1, 1)]);

        // Within a bucket, fields appear in roster order.
        assert_eq!(groups[0][0].filiere, "A");
        assert_eq!(groups[0][2].filiere, "B");
    }

    #[test]
    fn mixed_mode_keeps_uneven_bucket_totals() {
        let students = roster(&[("A", 4), ("B", 1), ("C", 1)]);
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        let groups = partition(&students, GroupSpec { size: 3, mixed: true }, &mut rng)
            .expect("partition");
        let sizes: Vec<usize> = groups.iter().map(|g| g.len()).collect();
        assert_eq!(sizes, vec![4, 2]);
        assert_is_partition(&students, &groups);
    }

    #[test]
    fn mixed_mode_drops_buckets_no_field_reaches() {
        // ceil(6/2) = 3 buckets but no field has more than 2 members.
        let students = roster(&[("A", 2), ("B", 2), ("C", 2)]);
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let groups = partition(&students, GroupSpec { size: 2, mixed: true }, &mut rng)
            .expect("partition");
        assert_eq!(groups.len(), 2);
        assert_is_partition(&students, &groups);
    }

    #[test]
    fn same_seed_gives_same_partition() {
        let students = roster(&[("A", 6), ("B", 5), ("C", 3)]);
        for mixed in [false, true] {
            let spec = GroupSpec { size: 4, mixed };
            let a = partition(&students, spec, &mut ChaCha8Rng::seed_from_u64(42)).expect("a");
            let b = partition(&students, spec, &mut ChaCha8Rng::seed_from_u64(42)).expect("b");
            assert_eq!(a, b);
        }
    }

    #[test]
    fn rejects_empty_roster_and_small_size() {
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        assert_eq!(
            partition(&[], GroupSpec { size: 3, mixed: false }, &mut rng),
            Err(PartitionError::EmptyInput)
        );
        let students = roster(&[("A", 3)]);
        assert_eq!(
            partition(&students, GroupSpec { size: 1, mixed: true }, &mut rng),
            Err(PartitionError::InvalidSize(1))
        );
        assert_eq!(PartitionError::InvalidSize(1).code(), "invalid_group_size");
    }
}
