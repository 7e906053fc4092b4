// Test modules for natlink
// Shared fixtures live in `support`; everything else mirrors a source module

mod support;

mod addr_tests;
mod packet_tests;
