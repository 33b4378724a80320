//! Minimal resource-manager template renderer.
//!
//! Produces one public IP, NIC(s) and VM per member, a virtual network
//! (shared or per member), a security group opening the management and
//! named ports, and an optional load balancer for the load-balanced roles.

use std::collections::BTreeSet;

use serde_json::{Value, json};

use crate::arm::{OS_TAG, PORTS_TAG, ROLE_TAG};
use crate::types::{
    DeploymentContext, FleetDescriptor, GuestOsFamily, MemberSpec, StorageMode, TemplateBlob,
};
use crate::{Error, Result, TemplateBuilder};

const SCHEMA: &str =
    "https://schema.management.azure.com/schemas/2019-04-01/deploymentTemplate.json#";

#[derive(Debug, Default, Clone)]
pub struct ArmTemplateBuilder;

impl ArmTemplateBuilder {
    fn vnet_name(ctx: &DeploymentContext, shared: bool, role: &str) -> String {
        if shared {
            format!("{}-vnet", ctx.unit_index)
        } else {
            format!("{role}-vnet")
        }
    }

    fn image_reference(member: &MemberSpec) -> Value {
        match member.image.marketplace_parts() {
            Some([publisher, offer, sku, version]) => json!({
                "publisher": publisher,
                "offer": offer,
                "sku": sku,
                "version": version,
            }),
            None => json!({ "id": member.image.0 }),
        }
    }

    fn disk_sku(storage: StorageMode) -> &'static str {
        match storage {
            StorageMode::NewPremium => "Premium_LRS",
            StorageMode::Existing | StorageMode::NewStandard => "Standard_LRS",
        }
    }

    fn vnet(name: &str, location: &str) -> Value {
        json!({
            "type": "Microsoft.Network/virtualNetworks",
            "apiVersion": "2023-04-01",
            "name": name,
            "location": location,
            "properties": {
                "addressSpace": { "addressPrefixes": ["10.0.0.0/16"] },
                "subnets": [
                    { "name": "default", "properties": { "addressPrefix": "10.0.0.0/24" } },
                    { "name": "extra", "properties": { "addressPrefix": "10.0.1.0/24" } }
                ]
            }
        })
    }

    fn security_group(fleet: &FleetDescriptor, location: &str) -> Value {
        let mut ports: BTreeSet<u16> = BTreeSet::new();
        for member in &fleet.members {
            ports.insert(member.os.default_management_port());
            ports.extend(member.ports.values().copied());
        }

        let rules: Vec<Value> = ports
            .iter()
            .enumerate()
            .map(|(i, port)| {
                json!({
                    "name": format!("allow-{port}"),
                    "properties": {
                        "priority": 100 + i,
                        "direction": "Inbound",
                        "access": "Allow",
                        "protocol": "*",
                        "sourceAddressPrefix": "*",
                        "sourcePortRange": "*",
                        "destinationAddressPrefix": "*",
                        "destinationPortRange": port.to_string(),
                    }
                })
            })
            .collect();

        json!({
            "type": "Microsoft.Network/networkSecurityGroups",
            "apiVersion": "2023-04-01",
            "name": "vf-nsg",
            "location": location,
            "properties": { "securityRules": rules }
        })
    }

    fn load_balancer(roles: &[String], location: &str) -> Vec<Value> {
        if roles.is_empty() {
            return Vec::new();
        }
        vec![
            json!({
                "type": "Microsoft.Network/publicIPAddresses",
                "apiVersion": "2023-04-01",
                "name": "vf-lb-pip",
                "location": location,
                "sku": { "name": "Standard" },
                "properties": { "publicIPAllocationMethod": "Static" }
            }),
            json!({
                "type": "Microsoft.Network/loadBalancers",
                "apiVersion": "2023-04-01",
                "name": "vf-lb",
                "location": location,
                "sku": { "name": "Standard" },
                "dependsOn": ["[resourceId('Microsoft.Network/publicIPAddresses', 'vf-lb-pip')]"],
                "properties": {
                    "frontendIPConfigurations": [{
                        "name": "frontend",
                        "properties": {
                            "publicIPAddress": { "id": "[resourceId('Microsoft.Network/publicIPAddresses', 'vf-lb-pip')]" }
                        }
                    }],
                    "backendAddressPools": [{ "name": "backend" }]
                }
            }),
        ]
    }

    fn member_resources(
        fleet: &FleetDescriptor,
        member: &MemberSpec,
        ctx: &DeploymentContext,
    ) -> Result<Vec<Value>> {
        let location = &ctx.region;
        let vm = &member.role;
        let vnet = Self::vnet_name(ctx, fleet.network.shared_vnet, vm);
        let behind_lb = fleet.network.load_balanced.contains(&member.role);

        let mut resources = vec![json!({
            "type": "Microsoft.Network/publicIPAddresses",
            "apiVersion": "2023-04-01",
            "name": format!("{vm}-pip"),
            "location": location,
            "properties": { "publicIPAllocationMethod": "Static" }
        })];

        let mut nic_ids = Vec::new();
        for index in 0..=fleet.network.extra_nics {
            let (nic, subnet, primary) = if index == 0 {
                (format!("{vm}-nic"), "default", true)
            } else {
                (format!("{vm}-nic{index}"), "extra", false)
            };

            let mut ip_config = json!({
                "subnet": { "id": format!("[resourceId('Microsoft.Network/virtualNetworks/subnets', '{vnet}', '{subnet}')]") },
                "privateIPAllocationMethod": "Dynamic",
            });
            if primary {
                ip_config["publicIPAddress"] = json!({
                    "id": format!("[resourceId('Microsoft.Network/publicIPAddresses', '{vm}-pip')]")
                });
                if behind_lb {
                    ip_config["loadBalancerBackendAddressPools"] = json!([{
                        "id": "[resourceId('Microsoft.Network/loadBalancers/backendAddressPools', 'vf-lb', 'backend')]"
                    }]);
                }
            }

            let mut depends = vec![
                format!("[resourceId('Microsoft.Network/virtualNetworks', '{vnet}')]"),
                "[resourceId('Microsoft.Network/networkSecurityGroups', 'vf-nsg')]".to_string(),
            ];
            if primary {
                depends.push(format!(
                    "[resourceId('Microsoft.Network/publicIPAddresses', '{vm}-pip')]"
                ));
                if behind_lb {
                    depends.push("[resourceId('Microsoft.Network/loadBalancers', 'vf-lb')]".into());
                }
            }

            resources.push(json!({
                "type": "Microsoft.Network/networkInterfaces",
                "apiVersion": "2023-04-01",
                "name": nic,
                "location": location,
                "dependsOn": depends,
                "properties": {
                    "ipConfigurations": [{ "name": "ipconfig1", "properties": ip_config }],
                    "networkSecurityGroup": { "id": "[resourceId('Microsoft.Network/networkSecurityGroups', 'vf-nsg')]" }
                }
            }));
            nic_ids.push((nic, primary));
        }

        let os_profile = match member.os {
            GuestOsFamily::Windows => {
                let password = ctx.admin.password.as_ref().ok_or_else(|| {
                    Error::InvalidTemplate(format!("windows member {vm} needs an admin password"))
                })?;
                json!({
                    "computerName": vm,
                    "adminUsername": ctx.admin.user,
                    "adminPassword": password,
                })
            }
            GuestOsFamily::Linux | GuestOsFamily::FreeBsd => {
                let mut profile = json!({
                    "computerName": vm,
                    "adminUsername": ctx.admin.user,
                    "linuxConfiguration": {
                        "disablePasswordAuthentication": ctx.admin.password.is_none(),
                    }
                });
                if let Some(password) = &ctx.admin.password {
                    profile["adminPassword"] = json!(password);
                }
                if let Some(key) = &ctx.admin.ssh_public_key {
                    profile["linuxConfiguration"]["ssh"] = json!({
                        "publicKeys": [{
                            "path": format!("/home/{}/.ssh/authorized_keys", ctx.admin.user),
                            "keyData": key,
                        }]
                    });
                }
                if ctx.admin.password.is_none() && ctx.admin.ssh_public_key.is_none() {
                    return Err(Error::InvalidTemplate(format!(
                        "member {vm} needs an admin password or ssh key"
                    )));
                }
                profile
            }
        };

        let mut ports = member.ports.clone();
        let management = match member.os {
            GuestOsFamily::Windows => "rdp",
            _ => "ssh",
        };
        ports
            .entry(management.to_string())
            .or_insert_with(|| member.os.default_management_port());
        let ports_tag = serde_json::to_string(&ports)
            .map_err(|e| Error::InvalidTemplate(format!("ports of {vm}: {e}")))?;

        let network_interfaces: Vec<Value> = nic_ids
            .iter()
            .map(|(nic, primary)| {
                json!({
                    "id": format!("[resourceId('Microsoft.Network/networkInterfaces', '{nic}')]"),
                    "properties": { "primary": primary }
                })
            })
            .collect();
        let depends: Vec<String> = nic_ids
            .iter()
            .map(|(nic, _)| format!("[resourceId('Microsoft.Network/networkInterfaces', '{nic}')]"))
            .collect();

        resources.push(json!({
            "type": "Microsoft.Compute/virtualMachines",
            "apiVersion": "2023-03-01",
            "name": vm,
            "location": location,
            "tags": {
                ROLE_TAG: member.role,
                PORTS_TAG: ports_tag,
                OS_TAG: member.os.as_str(),
            },
            "dependsOn": depends,
            "properties": {
                "hardwareProfile": { "vmSize": member.sku },
                "osProfile": os_profile,
                "storageProfile": {
                    "imageReference": Self::image_reference(member),
                    "osDisk": {
                        "createOption": "FromImage",
                        "managedDisk": { "storageAccountType": Self::disk_sku(member.storage) }
                    }
                },
                "networkProfile": { "networkInterfaces": network_interfaces },
                "diagnosticsProfile": { "bootDiagnostics": { "enabled": true } }
            }
        }));

        Ok(resources)
    }
}

impl TemplateBuilder for ArmTemplateBuilder {
    fn render(&self, fleet: &FleetDescriptor, ctx: &DeploymentContext) -> Result<TemplateBlob> {
        if fleet.members.is_empty() {
            return Err(Error::InvalidTemplate("fleet has no members".into()));
        }

        let mut roles = BTreeSet::new();
        for member in &fleet.members {
            if !roles.insert(member.role.as_str()) {
                return Err(Error::InvalidTemplate(format!(
                    "duplicate role {}",
                    member.role
                )));
            }
        }

        let location = ctx.region.as_str();
        let mut resources = vec![Self::security_group(fleet, location)];

        if fleet.network.shared_vnet {
            resources.push(Self::vnet(&Self::vnet_name(ctx, true, ""), location));
        } else {
            for member in &fleet.members {
                resources.push(Self::vnet(
                    &Self::vnet_name(ctx, false, &member.role),
                    location,
                ));
            }
        }

        resources.extend(Self::load_balancer(&fleet.network.load_balanced, location));

        for member in &fleet.members {
            resources.extend(Self::member_resources(fleet, member, ctx)?);
        }

        Ok(TemplateBlob(json!({
            "$schema": SCHEMA,
            "contentVersion": "1.0.0.0",
            "metadata": {
                "container": ctx.container,
                "run": ctx.run_id,
            },
            "resources": resources,
        })))
    }
}
