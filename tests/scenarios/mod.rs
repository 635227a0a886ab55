mod crypto_read_test;
mod prefix_isolation_test;
mod txn_test;
mod watch_test;
