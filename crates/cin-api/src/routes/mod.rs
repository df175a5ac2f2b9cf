pub mod dhcp;
pub mod health;
pub mod leases;
pub mod switches;
