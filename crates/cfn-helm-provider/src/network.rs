//! Network placement detection for private clusters
//!
//! A release against a cluster whose API endpoint is not open to the world
//! must run from inside the cluster network. When the model names a cluster
//! but no placement, the placement is derived from the cluster itself.

use cfn_helm_aws::{ClusterApi, NetworkApi, RouteTable, Subnet};
use cfn_helm_core::{HelmReleaseModel, VpcConfiguration};
use std::collections::{BTreeSet, HashMap};

use crate::error::{ProviderError, Result};

const OPEN_CIDR: &str = "0.0.0.0/0";

/// Placement a release needs, if any
///
/// Returns `None` for models with an explicit placement, models addressed by
/// kubeconfig and clusters with a fully public endpoint.
pub async fn detect_placement(
    clusters: &dyn ClusterApi,
    network: &dyn NetworkApi,
    model: &HelmReleaseModel,
    max_subnets: usize,
) -> Result<Option<VpcConfiguration>> {
    let Some(cluster_id) = model.cluster_id.as_deref() else {
        return Ok(None);
    };
    if model.placement().is_some() {
        return Ok(None);
    }

    let cluster = clusters
        .describe_cluster(cluster_id)
        .await
        .map_err(ProviderError::invalid)?;
    let vpc = cluster.resources_vpc_config.unwrap_or_default();

    if vpc.endpoint_public_access && vpc.public_access_cidrs.iter().any(|c| c == OPEN_CIDR) {
        return Ok(None);
    }
    tracing::info!(cluster = %cluster_id, "detected private cluster, adding VPC configuration");

    let subnets = routed_subnets(network, &vpc.subnet_ids).await?;
    if subnets.is_empty() {
        return Err(ProviderError::InvalidRequest(format!(
            "no subnets with NAT/Transit Gateway found for the cluster {}, use VPCConfiguration to specify VPC settings",
            cluster_id
        )));
    }
    let subnets = limit_subnets(subnets, max_subnets);

    let security_groups: Vec<String> = vpc
        .cluster_security_group_id
        .into_iter()
        .chain(vpc.security_group_ids)
        .collect();

    let subnet_ids: Vec<String> = subnets.into_iter().map(|s| s.subnet_id).collect();
    tracing::info!(subnets = ?subnet_ids, security_groups = ?security_groups, "using detected placement");
    Ok(Some(VpcConfiguration::new(security_groups, subnet_ids)))
}

/// Subnets whose route table sends traffic through a NAT or transit gateway
async fn routed_subnets(network: &dyn NetworkApi, subnet_ids: &[String]) -> Result<Vec<Subnet>> {
    let subnets = network
        .describe_subnets(subnet_ids)
        .await
        .map_err(ProviderError::invalid)?;

    let mut tables: HashMap<String, Vec<RouteTable>> = HashMap::new();
    let mut routed = Vec::new();
    for subnet in subnets {
        if !tables.contains_key(&subnet.vpc_id) {
            let found = network
                .describe_route_tables(&subnet.vpc_id)
                .await
                .map_err(ProviderError::invalid)?;
            tables.insert(subnet.vpc_id.clone(), found);
        }
        let vpc_tables = tables.get(&subnet.vpc_id).map(Vec::as_slice).unwrap_or_default();

        if route_table_for(vpc_tables, &subnet.subnet_id).is_some_and(has_gateway_route) {
            routed.push(subnet);
        }
    }
    Ok(routed)
}

/// The explicitly associated table of a subnet, else the main table
fn route_table_for<'a>(tables: &'a [RouteTable], subnet_id: &str) -> Option<&'a RouteTable> {
    tables
        .iter()
        .find(|t| {
            t.associations
                .iter()
                .any(|a| a.subnet_id.as_deref() == Some(subnet_id))
        })
        .or_else(|| tables.iter().find(|t| t.associations.iter().any(|a| a.main)))
}

fn has_gateway_route(table: &RouteTable) -> bool {
    table
        .routes
        .iter()
        .any(|r| r.nat_gateway_id.is_some() || r.transit_gateway_id.is_some())
}

/// Spread at most `max` subnets evenly over the availability zones
fn limit_subnets(subnets: Vec<Subnet>, max: usize) -> Vec<Subnet> {
    if subnets.len() <= max {
        return subnets;
    }
    tracing::info!(found = subnets.len(), max, "more subnets than a function supports, limiting");

    let zones: BTreeSet<&str> = subnets.iter().map(|s| s.availability_zone.as_str()).collect();
    let per_zone = (max / zones.len()).max(1);

    let mut limited: Vec<Subnet> = zones
        .iter()
        .flat_map(|zone| {
            subnets
                .iter()
                .filter(move |s| s.availability_zone == *zone)
                .take(per_zone)
                .cloned()
        })
        .collect();
    limited.truncate(max);
    limited
}

#[cfg(test)]
mod tests {
    use super::*;
    use cfn_helm_aws::{Cluster, MockAws, Route, RouteTableAssociation, VpcConfigResponse};

    fn cluster(public: bool, cidrs: &[&str], subnets: &[&str]) -> Cluster {
        Cluster {
            name: "eks".to_string(),
            status: Some("ACTIVE".to_string()),
            resources_vpc_config: Some(VpcConfigResponse {
                subnet_ids: subnets.iter().map(|s| s.to_string()).collect(),
                security_group_ids: vec!["sg-extra".to_string()],
                cluster_security_group_id: Some("sg-cluster".to_string()),
                vpc_id: Some("vpc-1".to_string()),
                endpoint_public_access: public,
                endpoint_private_access: true,
                public_access_cidrs: cidrs.iter().map(|c| c.to_string()).collect(),
            }),
            ..Default::default()
        }
    }

    fn subnet(id: &str, zone: &str) -> Subnet {
        Subnet {
            subnet_id: id.to_string(),
            vpc_id: "vpc-1".to_string(),
            availability_zone: zone.to_string(),
        }
    }

    fn table(id: &str, subnet: Option<&str>, main: bool, nat: bool) -> RouteTable {
        RouteTable {
            route_table_id: id.to_string(),
            associations: vec![RouteTableAssociation {
                subnet_id: subnet.map(str::to_string),
                main,
            }],
            routes: vec![Route {
                nat_gateway_id: nat.then(|| "nat-1".to_string()),
                transit_gateway_id: None,
            }],
        }
    }

    fn model() -> HelmReleaseModel {
        HelmReleaseModel {
            cluster_id: Some("eks".to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_public_cluster_needs_no_placement() {
        let aws = MockAws::new().with_cluster(cluster(true, &["10.0.0.0/8", "0.0.0.0/0"], &["a"]));
        assert_eq!(detect_placement(&aws, &aws, &model(), 16).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_private_cluster_uses_routed_subnets() {
        let aws = MockAws::new()
            .with_cluster(cluster(false, &["0.0.0.0/0"], &["subnet-a", "subnet-b", "subnet-c"]))
            .with_subnets(vec![
                subnet("subnet-a", "us-east-1a"),
                subnet("subnet-b", "us-east-1b"),
                subnet("subnet-c", "us-east-1c"),
            ])
            .with_route_tables(vec![
                table("rtb-a", Some("subnet-a"), false, true),
                table("rtb-b", Some("subnet-b"), false, false),
                table("rtb-main", None, true, true),
            ]);

        let placement = detect_placement(&aws, &aws, &model(), 16).await.unwrap().unwrap();
        assert_eq!(placement.subnet_ids, vec!["subnet-a", "subnet-c"]);
        assert_eq!(placement.security_group_ids, vec!["sg-cluster", "sg-extra"]);
    }

    #[tokio::test]
    async fn test_restricted_public_endpoint_is_private() {
        let aws = MockAws::new()
            .with_cluster(cluster(true, &["203.0.113.0/24"], &["subnet-a"]))
            .with_subnets(vec![subnet("subnet-a", "us-east-1a")])
            .with_route_tables(vec![table("rtb-a", Some("subnet-a"), false, true)]);

        assert!(detect_placement(&aws, &aws, &model(), 16).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_no_routed_subnet_is_an_error() {
        let aws = MockAws::new()
            .with_cluster(cluster(false, &[], &["subnet-a"]))
            .with_subnets(vec![subnet("subnet-a", "us-east-1a")])
            .with_route_tables(vec![table("rtb-a", Some("subnet-a"), false, false)]);

        let err = detect_placement(&aws, &aws, &model(), 16).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "no subnets with NAT/Transit Gateway found for the cluster eks, use VPCConfiguration to specify VPC settings"
        );
    }

    #[tokio::test]
    async fn test_explicit_placement_wins() {
        let aws = MockAws::new();
        let model = HelmReleaseModel {
            vpc_configuration: Some(VpcConfiguration::new(["sg-1"], ["subnet-1"])),
            ..model()
        };
        assert_eq!(detect_placement(&aws, &aws, &model, 16).await.unwrap(), None);
    }

    #[test]
    fn test_limit_subnets_spreads_over_zones() {
        let subnets: Vec<Subnet> = (0..20)
            .map(|i| subnet(&format!("subnet-{:02}", i), ["us-east-1b", "us-east-1a"][i % 2]))
            .collect();

        let limited = limit_subnets(subnets, 16);
        assert_eq!(limited.len(), 16);
        let in_a = limited.iter().filter(|s| s.availability_zone == "us-east-1a").count();
        assert_eq!(in_a, 8);
        // zones are visited in order
        assert_eq!(limited[0].availability_zone, "us-east-1a");
    }

    #[test]
    fn test_limit_subnets_with_many_zones() {
        let subnets: Vec<Subnet> = (0..20)
            .map(|i| subnet(&format!("subnet-{:02}", i), &format!("zone-{:02}", i)))
            .collect();
        assert_eq!(limit_subnets(subnets, 16).len(), 16);
    }
}
