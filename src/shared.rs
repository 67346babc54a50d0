use crate::config::settings::SharedNetworkSettings;
use crate::subnet::SubnetId;

#[derive(Debug, Clone, PartialEq, Eq)]
struct SharedNetwork {
    name: String,
    subnet_ids: Vec<SubnetId>,
}

/// Groups of subnets declared equivalent for allocation fallback. A subnet is
/// expected to appear in at most one group; the first group wins otherwise.
#[derive(Debug, Clone, Default)]
pub struct SharedNetworks {
    networks: Vec<SharedNetwork>,
}

impl SharedNetworks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_settings(settings: &[SharedNetworkSettings]) -> Self {
        let mut networks = Self::new();
        for conf in settings {
            networks.add(&conf.name, conf.subnet_ids.clone());
        }
        networks
    }

    pub fn add(&mut self, name: &str, subnet_ids: Vec<SubnetId>) {
        self.networks.push(SharedNetwork {
            name: name.into(),
            subnet_ids,
        });
    }

    pub fn remove(&mut self, name: &str) {
        if let Some(pos) = self.networks.iter().position(|n| n.name == name) {
            self.networks.remove(pos);
        }
    }

    pub fn update(&mut self, name: &str, subnet_ids: Vec<SubnetId>) {
        if let Some(network) = self.networks.iter_mut().find(|n| n.name == name) {
            network.subnet_ids = subnet_ids;
        }
    }

    /// The other members of the first group containing `subnet_id`, in
    /// declared order.
    pub fn subnets_shared_with(&self, subnet_id: SubnetId) -> Vec<SubnetId> {
        for network in &self.networks {
            if network.subnet_ids.contains(&subnet_id) {
                return network
                    .subnet_ids
                    .iter()
                    .copied()
                    .filter(|id| *id != subnet_id)
                    .collect();
            }
        }
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_lookup() {
        let mut networks = SharedNetworks::new();
        networks.add("s1", vec![3171095, 3171096]);

        for _ in 0..10 {
            assert_eq!(networks.subnets_shared_with(3171095), vec![3171096]);
            assert_eq!(networks.subnets_shared_with(3171096), vec![3171095]);
            assert!(networks.subnets_shared_with(3171097).is_empty());
        }
    }

    #[test]
    fn first_group_wins() {
        let mut networks = SharedNetworks::new();
        networks.add("a", vec![1, 2]);
        networks.add("b", vec![1, 3]);
        assert_eq!(networks.subnets_shared_with(1), vec![2]);
    }

    #[test]
    fn update_and_remove() {
        let mut networks = SharedNetworks::new();
        networks.add("lab", vec![1, 2]);
        networks.update("lab", vec![1, 2, 3]);
        assert_eq!(networks.subnets_shared_with(1), vec![2, 3]);
        networks.remove("lab");
        assert!(networks.subnets_shared_with(1).is_empty());
    }
}
